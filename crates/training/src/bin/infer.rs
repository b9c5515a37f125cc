use clap::Parser;
use training::util::{run_infer, InferArgs};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let dir = run_infer(InferArgs::parse())?;
    println!("saved inference samples to {}", dir.display());
    Ok(())
}
