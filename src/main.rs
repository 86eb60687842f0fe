use std::process::ExitCode;

use rssr_lib::commands::{App, COMMANDS};
use rssr_lib::config::AppConfig;

const USAGE: &str = "usage: rssr serve | rssr <command> [json-args] | rssr commands";

#[tokio::main]
async fn main() -> ExitCode {
    let env_files = rssr_lib::load_env();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    rssr_lib::logging::init(&config.log_level);
    for path in &env_files {
        tracing::debug!(path = %path.display(), "loaded env file");
    }

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    if command == "commands" {
        for name in COMMANDS {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let app = match App::connect(&config).await {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(%error, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    if command == "serve" {
        return match rssr_lib::serve(app).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                tracing::error!(%error, "serve failed");
                ExitCode::FAILURE
            }
        };
    }

    let payload = match args.next() {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                eprintln!("arguments must be a JSON object: {error}");
                return ExitCode::from(2);
            }
        },
        None => serde_json::Value::Null,
    };

    match app.invoke(&command, payload).await {
        Ok(value) => {
            println!("{}", render(&value));
            ExitCode::SUCCESS
        }
        Err(error) => {
            let body = serde_json::to_value(&error).unwrap_or_default();
            println!("{}", render(&body));
            ExitCode::FAILURE
        }
    }
}

fn render(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
