use std::path::Path;

use anyhow::Result;

/// Execute the `status` command: print the latest checkpoint.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let (pipeline, state) = super::open_state(&config)?;

    match state.load_latest(&pipeline)? {
        Some(checkpoint) => super::print_checkpoint(&checkpoint),
        None => println!("No runs recorded for pipeline '{pipeline}'."),
    }
    Ok(())
}
