use clap::Parser;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = agentmux_server::cli::Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    if let Err(e) = runtime.block_on(agentmux_server::run(config)) {
        log::error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
