//! Workspace setup: `arc init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use arc_pipeline::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!("Initialized arc workspace at {}", result.arc_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  .arc/");
        println!("  ├── arc.toml     # Configuration (phase commands, timeouts, tiers)");
        println!("  ├── runs/        # Checkpoints and phase artifacts");
        println!("  ├── logs/        # Daily logs");
        println!("  ├── teams/       # Resource storage");
        println!("  └── leases/      # Resource lease records");
        println!();
        println!("Next steps:");
        println!("  1. Add a command for each phase under [phases.<name>] in arc.toml");
        println!("  2. Run `arc run <plan>` to start a run");
    } else {
        println!("Arc workspace already initialized at {}", result.arc_dir.display());
        if result.wrote_config {
            println!("Wrote missing arc.toml with default settings.");
        }
    }
    Ok(())
}
