use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;

use tlmerge::cli::{Cli, Mode};
use tlmerge::conf::{self, manager::write_default_config, ConfigManager, DEFAULT_CONFIG_FILE};
use tlmerge::preprocess::Preprocessor;
use tlmerge::{scan, thumb};

fn main() {
    std::process::exit(run_main());
}

fn run_main() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not failures; anything else exits 1
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return code;
        }
    };
    let silent = cli.silent;

    match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            if !silent {
                eprintln!("tlmerge: {e:#}");
            }
            1
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let project = cli
        .project
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no project directory given; use --project or TLMERGE_PROJECT"))?;
    let config = Arc::new(ConfigManager::new(project.clone())?);

    // The date format shapes how other options parse, so it applies before
    // the config file loads
    if let Some(fmt) = &cli.date_format {
        config.root_mut().set_date_format(fmt)?;
    }

    let config_file = cli
        .config
        .clone()
        .unwrap_or_else(|| project.join(DEFAULT_CONFIG_FILE));
    let loaded_root = config.load_root_file(&config_file)?;
    cli.apply_to(&config)?;

    let (log_file, log_level) = {
        let root = config.root();
        (root.log_file.clone(), root.log_level)
    };
    conf::log::configure(log_file.as_deref(), log_level)?;

    // Per-directory config files, then the CLI again so it also beats them
    let sub_files = config.load_all()?;
    cli.apply_to(&config)?;

    let total_files = sub_files + loaded_root as usize;
    if total_files == 0 {
        tracing::info!("no config files found");
    } else {
        tracing::info!(
            "loaded {total_files} config file{}",
            if total_files == 1 { "" } else { "s" }
        );
    }

    if cli.make_config && !config_file.exists() {
        write_default_config(&config_file)?;
        tracing::info!("saved default configuration to \"{}\"", config_file.display());
    }

    match cli.mode {
        Mode::Scan => scan::run_scanner(&config)?,
        Mode::Preprocess => {
            let preprocessor = Preprocessor::new(Arc::clone(&config));
            let cancel = preprocessor.cancel_flag();
            // Ctrl-C requests a cooperative shutdown; the orchestrator
            // drains cleanly and the run exits 1
            ctrlc::set_handler(move || {
                cancel.store(true, Ordering::SeqCst);
            })?;
            preprocessor.run()?;
        }
        Mode::Thumb => thumb::generate_thumbnails(&config)?,
    }
    Ok(())
}
