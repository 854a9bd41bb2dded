//! Human-readable run summary

use evtflow_ipc::RingStats;
use evtflow_logic::RunSummary;

/// Render a run summary for the terminal
pub fn format_human_output(summary: &RunSummary) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str("evtflow run summary\n");
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");

    let status = if summary.is_lossless() {
        "✓ lossless"
    } else {
        "✗ events lost"
    };
    output.push_str(&format!("  status:        {}\n", status));
    output.push_str(&format!("  ordering:      {}\n", summary.mode));
    output.push_str(&format!(
        "  input:         {} records ({} rejected)\n",
        summary.input_records, summary.rejected
    ));
    output.push_str(&format!(
        "  dispatched:    {} (+{} replayed)\n",
        summary.dispatched, summary.redispatched
    ));
    output.push_str(&format!(
        "  completed:     {} ({} with processor errors)\n",
        summary.completed, summary.failed_events
    ));
    output.push_str(&format!(
        "  discarded:     {} duplicates, {} late\n",
        summary.duplicates, summary.stale
    ));
    output.push_str(&format!(
        "  abandoned:     {}\n",
        format_sequences(&summary.abandoned)
    ));
    output.push_str(&format!(
        "  gaps:          {}\n",
        format_sequences(&summary.gapped)
    ));
    output.push_str(&format!(
        "  end of run:    {}{}\n",
        if summary.end_of_run { "forwarded" } else { "not seen" },
        if summary.interrupted {
            " (interrupted)"
        } else {
            ""
        }
    ));
    output.push_str(&format!(
        "  elapsed:       {:.3} s ({:.0} events/s)\n",
        summary.elapsed_secs,
        summary.throughput()
    ));

    if !summary.workers.is_empty() {
        output.push('\n');
        output.push_str(&format!(
            "  {:<10} {:>10} {:>8} {:>10} {:>9} {:>9}  {}\n",
            "worker", "processed", "failed", "dispatched", "restarts", "timeouts", "last death"
        ));
        output.push_str("  ");
        output.push_str(&"-".repeat(58));
        output.push('\n');
        for worker in &summary.workers {
            output.push_str(&format!(
                "  {:<10} {:>10} {:>8} {:>10} {:>9} {:>9}  {}\n",
                worker.id.to_string(),
                worker.processed,
                worker.failed,
                worker.dispatched,
                worker.restarts,
                worker.timeouts,
                worker.last_death.as_deref().unwrap_or("-")
            ));
        }
    }

    output
}

/// Render ring statistics for `evtflow inspect`
pub fn format_ring_stats(name: &str, stats: &RingStats) -> String {
    let mut output = String::new();
    output.push_str(&format!("ring {}\n", name));
    output.push_str(&format!(
        "  capacity:      {} bytes\n  used:          {} bytes ({:.1}%)\n",
        stats.capacity,
        stats.used_bytes,
        if stats.capacity == 0 {
            0.0
        } else {
            stats.used_bytes as f64 * 100.0 / stats.capacity as f64
        }
    ));
    output.push_str(&format!("  queued:        {} records\n", stats.queued));
    output.push_str(&format!("  high water:    {} bytes\n", stats.high_water));
    output.push_str(&format!(
        "  pushed/popped: {} / {}\n",
        stats.total_pushed, stats.total_popped
    ));
    output.push_str(&format!("  attached:      {}\n", stats.attached));
    output.push_str(&format!(
        "  waiting:       {} writers\n",
        stats.waiting_writers
    ));
    if stats.poisoned {
        output.push_str("  POISONED: a process died holding the lock; recreate the ring\n");
    }
    output
}

/// Compact list of sequence numbers; long lists are elided in the middle
fn format_sequences(sequences: &[u64]) -> String {
    const SHOWN: usize = 8;
    if sequences.is_empty() {
        return "none".to_string();
    }
    let join = |s: &[u64]| {
        s.iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    if sequences.len() <= SHOWN {
        format!("{} [{}]", sequences.len(), join(sequences))
    } else {
        format!(
            "{} [{}, ... {}]",
            sequences.len(),
            join(&sequences[..SHOWN / 2]),
            join(&sequences[sequences.len() - SHOWN / 2..])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evtflow_logic::{WorkerId, WorkerSummary};

    #[test]
    fn test_format_sequences() {
        assert_eq!(format_sequences(&[]), "none");
        assert_eq!(format_sequences(&[2, 5]), "2 [2, 5]");
        let long: Vec<u64> = (1..=20).collect();
        assert_eq!(format_sequences(&long), "20 [1, 2, 3, 4, ... 17, 18, 19, 20]");
    }

    #[test]
    fn test_human_output_mentions_losses_and_workers() {
        let mut worker = WorkerSummary::new(WorkerId(1));
        worker.restarts = 2;
        worker.last_death = Some("exited (exit code 17)".to_string());
        let summary = RunSummary {
            mode: "strict".to_string(),
            input_records: 10,
            dispatched: 10,
            completed: 9,
            abandoned: vec![4],
            gapped: vec![4],
            workers: vec![worker],
            ..RunSummary::default()
        };
        let text = format_human_output(&summary);
        assert!(text.contains("events lost"));
        assert!(text.contains("abandoned:     1 [4]"));
        assert!(text.contains("worker-1"));
        assert!(text.contains("exit code 17"));
    }
}
