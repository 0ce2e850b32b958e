use clap::Parser;
use segload::cli::{run, Args};
use std::process::exit;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err}\n");
            let mut source: &dyn std::error::Error = &err;
            let mut index = 1;
            while let Some(cause) = source.source() {
                eprintln!("{:=^80}\n{cause}\n", format!(" ERROR CAUSE #{index} "));
                source = cause;
                index += 1;
            }
            exit(1);
        }
    }
}
