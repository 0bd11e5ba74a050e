//! Output ownership check run once all tasks are created.
use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConflictError;
use crate::factory::GENERATED_MARKER;
use crate::resource::Resource;
use crate::task::Task;

/// Fails when two tasks with different inputs write the same output path.
/// Generated resources may be claimed any number of times.
pub fn validate(tasks: &[Arc<Task>]) -> Result<(), ConflictError> {
    let mut claimed: HashMap<&Utf8Path, &[Resource]> = HashMap::new();

    for task in tasks {
        let inputs = task.inputs();

        for output in task.outputs() {
            let generated = output.path().as_str().contains(GENERATED_MARKER);

            if let Some(&stored) = claimed.get(output.abs_path())
                && !generated
                && stored != inputs
            {
                let blamed = conflicting_resource(output, inputs, stored);
                return Err(ConflictError {
                    output: output.path().to_owned(),
                    resource: blamed.path().to_owned(),
                    inputs: paths(inputs),
                    stored: paths(stored),
                });
            }

            claimed.insert(output.abs_path(), inputs);
        }
    }

    Ok(())
}

fn paths(resources: &[Resource]) -> Vec<Utf8PathBuf> {
    resources.iter().map(|r| r.path().to_owned()).collect()
}

/// Picks the input to blame for a collision on `output`. `primary` belongs to
/// the task being checked, `stored` to the task that claimed the output
/// first.
///
/// 1. A single-input set wins, `primary` checked first.
/// 2. Otherwise an input sharing the output's base name, `primary` first.
/// 3. Otherwise the first input of `primary`.
fn conflicting_resource<'a>(
    output: &Resource,
    primary: &'a [Resource],
    stored: &'a [Resource],
) -> &'a Resource {
    if primary.len() == 1 {
        return &primary[0];
    }
    if stored.len() == 1 {
        return &stored[0];
    }

    let name = output.base_name();
    primary
        .iter()
        .chain(stored)
        .find(|input| input.base_name() == name)
        .unwrap_or(&primary[0])
}
