use anyhow::Result;
use clap::Parser;
use gemcode_agent::{AgentLoop, RunOutcome};
use gemcode_core::AppConfig;
use gemcode_errors::{ErrorHandler, errors};
use gemcode_llm::GeminiClient;
use gemcode_observe::Observer;
use gemcode_tools::ToolDispatcher;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gemcode")]
#[command(about = "AI code assistant", long_about = None)]
struct Cli {
    /// Prompt to send to the model.
    user_prompt: String,

    /// Enable verbose output: token counts and tool call detail.
    #[arg(long)]
    verbose: bool,

    /// Maximum number of agent rounds before aborting.
    #[arg(long = "max-rounds")]
    max_rounds: Option<u64>,

    /// Directory the agent is confined to. Defaults to the current directory.
    #[arg(long = "sandbox-root")]
    sandbox_root: Option<PathBuf>,

    /// Override the configured model for this invocation.
    #[arg(long)]
    model: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let handler = ErrorHandler::new().verbose(cli.verbose);
    match run(&cli) {
        Ok(outcome) => {
            println!("Response:");
            println!("{}", outcome.text);
        }
        Err(err) => {
            eprintln!("{}", handler.handle(&err));
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<RunOutcome> {
    let root = match &cli.sandbox_root {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    if !root.is_dir() {
        return Err(errors::invalid_sandbox_root(&root.display().to_string()).into_error());
    }

    let mut cfg = AppConfig::load(&root)?;
    if let Some(model) = &cli.model {
        cfg.llm.model = model.clone();
    }
    if let Some(max_rounds) = cli.max_rounds {
        cfg.agent.max_rounds = max_rounds;
    }

    if std::env::var(&cfg.llm.api_key_env)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .is_none()
    {
        return Err(errors::missing_api_key(&cfg.llm.api_key_env).into_error());
    }

    let mut observer = Observer::new(&root)?;
    observer.set_verbose(cli.verbose);
    let observer = Arc::new(observer);

    let client = Arc::new(GeminiClient::new(cfg.llm.clone())?);
    let dispatcher = ToolDispatcher::new(&root, cfg.tools.clone(), observer.clone())?;
    let agent = AgentLoop::new(client, dispatcher, observer, cfg.agent.clone());
    agent.run(&cli.user_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prompt_and_flags() {
        let cli = Cli::try_parse_from([
            "gemcode",
            "explain main.py",
            "--verbose",
            "--max-rounds",
            "5",
            "--sandbox-root",
            "/tmp/project",
        ])
        .expect("parse");
        assert_eq!(cli.user_prompt, "explain main.py");
        assert!(cli.verbose);
        assert_eq!(cli.max_rounds, Some(5));
        assert_eq!(cli.sandbox_root, Some(PathBuf::from("/tmp/project")));
        assert_eq!(cli.model, None);
    }

    #[test]
    fn prompt_is_required() {
        assert!(Cli::try_parse_from(["gemcode"]).is_err());
    }

    #[test]
    fn missing_sandbox_root_fails_before_any_network_use() {
        let cli = Cli::try_parse_from([
            "gemcode",
            "hello",
            "--sandbox-root",
            "/definitely/not/a/real/dir",
        ])
        .expect("parse");
        let err = run(&cli).expect_err("invalid root");
        assert!(err.to_string().contains("Invalid Working Directory"));
    }
}
