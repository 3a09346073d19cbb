use std::env;
use std::path::PathBuf;

use blockvale_client::app::{self, DemoOptions};

fn main() {
    let mut options = DemoOptions::default();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(value) = args.next() else {
                    eprintln!("--config expects a path argument");
                    std::process::exit(2);
                };
                options.config_path = PathBuf::from(value);
            }
            "--seed" => {
                let Some(value) = args.next() else {
                    eprintln!("--seed expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u64>() {
                    Ok(parsed) => options.seed = Some(parsed),
                    Err(err) => {
                        eprintln!("invalid seed '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--ticks" => {
                let Some(value) = args.next() else {
                    eprintln!("--ticks expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u64>() {
                    Ok(parsed) => options.ticks = parsed,
                    Err(err) => {
                        eprintln!("invalid tick count '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--headless" => options.headless = true,
            "--help" | "-h" => {
                println!("Usage: blockvale_client [--config <path>] [--seed <u64>] [--ticks <n>] [--headless]");
                return;
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    app::run(options);
}
