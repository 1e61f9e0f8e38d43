//! Substitution of `${{ needs.<action>.outputs.<output> }}` references.

use std::collections::BTreeMap;

use super::materialize::ResolvedAction;
use super::paths::safe_join;
use crate::error::JobError;
use crate::project::run_command::{variables_in, VariableRef};

/// Rewrites every argument holding a variable reference into the referenced
/// dependency's output file path.
///
/// The whole argument is replaced, so an argument may hold at most one
/// reference. `dependencies` must contain only materialized,
/// completion-checked actions.
pub fn interpolate(
    args: &[String],
    dependencies: &BTreeMap<String, ResolvedAction>,
) -> Result<Vec<String>, JobError> {
    args.iter()
        .map(|arg| interpolate_arg(arg, dependencies))
        .collect()
}

fn interpolate_arg(
    arg: &str,
    dependencies: &BTreeMap<String, ResolvedAction>,
) -> Result<String, JobError> {
    let variable = match variables_in(arg).as_slice() {
        [] => return Ok(arg.to_string()),
        [single] => VariableRef::parse(single)?,
        _ => {
            return Err(JobError::InvalidVariableReference(format!(
                "Argument {arg} refers to more than one output"
            )))
        }
    };

    let not_found =
        || JobError::InvalidVariableReference(format!("No output corresponding to {arg} was found"));

    let dependency = dependencies.get(&variable.action_id).ok_or_else(not_found)?;
    let value = dependency
        .outputs()
        .get(&variable.output_id)
        .ok_or_else(not_found)?;
    let filename = value.as_str().ok_or_else(|| {
        JobError::InvalidVariableReference(format!(
            "Output {} of {} is not a filename",
            variable.output_id, variable.action_id
        ))
    })?;

    let path = safe_join(dependency.output_path(), filename)?;
    Ok(path.to_string_lossy().into_owned())
}

/// Returns `action` with its invocation interpolated.
pub fn interpolate_action(
    action: ResolvedAction,
    dependencies: &BTreeMap<String, ResolvedAction>,
) -> Result<ResolvedAction, JobError> {
    let invocation = interpolate(action.docker_invocation(), dependencies)?;
    Ok(action.with_invocation(invocation))
}
