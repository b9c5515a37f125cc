use clap::Parser;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = TrainArgs::parse();
    let summary = run_train(args)?;

    println!(
        "trained {} steps, last loss {}",
        summary.report.steps,
        summary
            .report
            .last_loss
            .map(|l| format!("{l:.6}"))
            .unwrap_or_else(|| "n/a".into())
    );
    println!("saved checkpoint to {}", summary.checkpoint.display());
    if let Some(dir) = summary.samples_dir {
        println!("saved inference samples to {}", dir.display());
    }
    Ok(())
}
