use std::path::Path;

use anyhow::Result;
use marketsync_engine::check_pipeline;
use marketsync_engine::config::validator;

/// Execute the `check` command: validate pipeline config, sources, and state.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = super::load(pipeline_path)?;

    // 2. Validate pipeline structure
    validator::validate_pipeline(&config)?;
    println!("Pipeline structure: OK");

    // 3. Check sources and state
    let result = check_pipeline(&config).await?;

    // 4. Report results
    for (name, outcome) in &result.sources {
        let label = format!("Source '{name}':");
        match outcome {
            Ok(()) => println!("{label:24} OK"),
            Err(message) => {
                println!("{label:24} FAILED");
                println!("  {message}");
            }
        }
    }

    if result.state_ok {
        println!("{:24} OK", "State backend:");
    } else {
        println!("{:24} FAILED", "State backend:");
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
