//! End-of-batch console summary.

use std::time::Duration;

use colored::Colorize;

use crate::batch::orchestrator::BatchSummary;

pub fn print_summary(summary: &BatchSummary, total_duration: Duration) {
    println!();
    println!("{}", "📊 Batch Results Summary".bright_cyan().bold());
    println!("{}", "========================".cyan());

    println!("Scenarios in dataset: {}", summary.total);
    println!("Executed: {}", summary.executed);
    println!("Skipped (already succeeded): {}", summary.skipped);
    println!("Succeeded: {}", summary.succeeded.to_string().green());
    println!("Failed: {}", summary.failed.to_string().red());
    println!("Server restarts consumed: {}", summary.restarts);

    if summary.executed > 0 {
        #[allow(clippy::cast_precision_loss)]
        let success_rate = (summary.succeeded as f64 / summary.executed as f64) * 100.0;
        println!("Success rate: {success_rate:.1}%");
    }
    println!("Total time: {total_duration:?}");

    if summary.stopped_early {
        println!("{}", "⚠️  Batch stopped before the end of the dataset".yellow());
    }
}
