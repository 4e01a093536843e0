use crate::config::generate::generate_starter_config;
use crate::config::{load_config, system_config_path, user_config_path};
use dialoguer::Confirm;
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/acuvim-collect, fall back to /etc when it can't be created
    let config_path = match user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(e)) => {
                eprintln!("Warning: Could not create directory for {}: {}", user_config.display(), e);
                eprintln!("Falling back to {}", system_config_path().display());
                system_config_path()
            }
            _ => user_config,
        },
        None => system_config_path(),
    };

    write_config(&config_content, &config_path)
}

fn write_config(config_content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("Config file already exists at {}. Overwrite?", path.display()))
            .default(false)
            .interact()?;
        if !overwrite {
            eprintln!("Left {} unchanged; use --stdout to print the starter config", path.display());
            return Ok(());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;

    println!("Config file written to {}", path.display());
    Ok(())
}

/// Returns whether the config is valid; problems are printed.
pub fn validate(config_path: Option<PathBuf>) -> Result<bool, Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match load_config(&path) {
        Ok(config) => {
            println!("✓ Config is valid");
            println!("  storage: {}", config.storage.path.display());
            println!("  output:  {}", config.output.directory.display());
            Ok(true)
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            Ok(false)
        }
    }
}
