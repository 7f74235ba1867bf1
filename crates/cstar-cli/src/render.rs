//! Output rendering for the cstar CLI.

use cstar_orch::{RunReport, RunStatusSummary};

/// Print the incomplete/complete sets for a run.
pub fn print_status_summary(run_id: &str, summary: &RunStatusSummary) {
    println!("Run `{run_id}` Current Status");
    println!();
    println!("{:<40}  {:<40}", "INCOMPLETE", "COMPLETE");
    println!("{}", "-".repeat(82));

    let rows = summary.incomplete.len().max(summary.complete.len()).max(1);
    for i in 0..rows {
        let open = summary.incomplete.get(i).map_or("N/A", String::as_str);
        let closed = summary.complete.get(i).map_or("N/A", String::as_str);
        println!("{open:<40}  {closed:<40}");
    }
}

/// Print the final statuses of a drive.
pub fn print_run_report(run_id: &str, report: &RunReport) {
    println!("Run `{run_id}` finished");
    println!();
    println!("{:<40}  {:<12}", "STEP", "STATUS");
    println!("{}", "-".repeat(54));

    for (name, status) in &report.statuses {
        println!("{name:<40}  {status:<12}");
    }

    println!();
    println!(
        "{} complete, {} incomplete",
        report.complete().len(),
        report.incomplete().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstar_core::Status;
    use std::collections::BTreeMap;

    #[test]
    fn report_counts_partition_the_steps() {
        let report = RunReport {
            statuses: BTreeMap::from([
                ("a".to_string(), Status::Done),
                ("b".to_string(), Status::Failed),
                ("c".to_string(), Status::Unsubmitted),
            ]),
        };
        assert_eq!(report.complete(), vec!["a"]);
        assert_eq!(report.incomplete(), vec!["b", "c"]);
        assert!(!report.succeeded());
    }
}
