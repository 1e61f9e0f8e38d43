//! Dependency completion check.
//!
//! An action is finished when every declared output file exists under its
//! output directory. There is no other completion marker.

use super::materialize::ResolvedAction;
use super::paths::safe_join;
use crate::error::JobError;

/// Fails with `DependencyNotFinished` naming the first missing output.
///
/// Outputs whose declared value is not a filename are skipped here; they are
/// rejected by interpolation if anything refers to them.
pub fn assert_finished(action: &ResolvedAction) -> Result<(), JobError> {
    for (_, filename) in action.outputs().files() {
        let expected_path = safe_join(action.output_path(), filename)?;
        if !expected_path.exists() {
            return Err(JobError::DependencyNotFinished {
                action_id: action.action_id().to_string(),
                expected_path,
            });
        }
    }
    Ok(())
}
