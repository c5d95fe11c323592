//! Per-model request statistics collected from observed traffic

use crate::quantile::{self, Summary};
use argus_common::ModelResponse;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Bounded list of duration samples.
///
/// Once a push takes the window past its cap, the oldest `cap / 2` samples
/// are dropped in one batch, so the window always holds the newest samples
/// and trims happen once every `cap / 2` inserts.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: Vec<f64>,
    cap: usize,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
        if self.samples.len() > self.cap {
            self.samples.drain(..self.cap / 2);
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Counters and sample windows for one model
#[derive(Debug)]
struct ModelStats {
    requests: u64,
    successes: u64,
    failures: u64,
    generated_tokens: u64,
    prompt_tokens: u64,
    /// Wall-clock seconds per successful request
    durations: SampleWindow,
    /// Model load seconds, only when the backend reported a load
    load_durations: SampleWindow,
}

impl ModelStats {
    fn new(cap: usize) -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            generated_tokens: 0,
            prompt_tokens: 0,
            durations: SampleWindow::new(cap),
            load_durations: SampleWindow::new(cap),
        }
    }
}

/// Shared statistics store.
///
/// Writers take the exclusive lock for a handful of integer updates and at
/// most two vector pushes. Every reader gets an owned copy, and quantiles
/// are computed after the read lock is released.
#[derive(Debug)]
pub struct StatsStore {
    models: RwLock<HashMap<String, ModelStats>>,
    max_samples: usize,
}

impl StatsStore {
    pub fn new(max_samples: usize) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            max_samples,
        }
    }

    /// Record a request that produced a terminal record
    pub fn record_success(&self, model: &str, record: &ModelResponse, elapsed_secs: f64) {
        let mut models = self.models.write();
        let stats = models
            .entry(model.to_string())
            .or_insert_with(|| ModelStats::new(self.max_samples));

        stats.requests += 1;
        stats.successes += 1;
        stats.generated_tokens += record.eval_count;
        stats.prompt_tokens += record.prompt_eval_count;
        stats.durations.push(elapsed_secs);

        if record.load_duration > 0 {
            stats.load_durations.push(record.load_duration_secs());
        }
    }

    /// Record a request that failed; durations and tokens are left alone
    pub fn record_failure(&self, model: &str) {
        let mut models = self.models.write();
        let stats = models
            .entry(model.to_string())
            .or_insert_with(|| ModelStats::new(self.max_samples));

        stats.requests += 1;
        stats.failures += 1;
    }

    pub fn request_counts(&self) -> BTreeMap<String, u64> {
        self.counter(|s| s.requests)
    }

    pub fn success_counts(&self) -> BTreeMap<String, u64> {
        self.counter(|s| s.successes)
    }

    pub fn failure_counts(&self) -> BTreeMap<String, u64> {
        self.counter(|s| s.failures)
    }

    /// Cumulative generated tokens per model
    pub fn token_counts(&self) -> BTreeMap<String, u64> {
        self.counter(|s| s.generated_tokens)
    }

    pub fn prompt_token_counts(&self) -> BTreeMap<String, u64> {
        self.counter(|s| s.prompt_tokens)
    }

    /// Response duration summaries, omitting models with no samples
    pub fn duration_stats(&self) -> BTreeMap<String, Summary> {
        summarize_all(self.windows(|s| &s.durations))
    }

    /// Model load duration summaries, omitting models with no samples
    pub fn load_duration_stats(&self) -> BTreeMap<String, Summary> {
        summarize_all(self.windows(|s| &s.load_durations))
    }

    fn counter(&self, field: impl Fn(&ModelStats) -> u64) -> BTreeMap<String, u64> {
        let models = self.models.read();
        models
            .iter()
            .map(|(model, stats)| (model.clone(), field(stats)))
            .collect()
    }

    fn windows(&self, window: impl Fn(&ModelStats) -> &SampleWindow) -> Vec<(String, Vec<f64>)> {
        let models = self.models.read();
        models
            .iter()
            .map(|(model, stats)| (model, window(stats)))
            .filter(|(_, window)| !window.is_empty())
            .map(|(model, window)| (model.clone(), window.as_slice().to_vec()))
            .collect()
    }
}

fn summarize_all(windows: Vec<(String, Vec<f64>)>) -> BTreeMap<String, Summary> {
    windows
        .into_iter()
        .filter_map(|(model, samples)| quantile::summarize(&samples).map(|s| (model, s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn terminal(eval_count: u64, prompt_eval_count: u64, load_duration: u64) -> ModelResponse {
        ModelResponse {
            model: "llama3".to_string(),
            done: true,
            eval_count,
            prompt_eval_count,
            load_duration,
            ..Default::default()
        }
    }

    #[test]
    fn test_window_trims_oldest_half() {
        let mut window = SampleWindow::new(1000);
        for i in 0..1000 {
            window.push(i as f64);
        }
        assert_eq!(window.as_slice().len(), 1000);

        window.push(1000.0);
        assert_eq!(window.as_slice().len(), 501);
        assert_eq!(window.as_slice()[0], 500.0);
        assert_eq!(window.as_slice()[500], 1000.0);
    }

    #[test]
    fn test_window_never_exceeds_cap() {
        let mut window = SampleWindow::new(10);
        for i in 0..97 {
            window.push(i as f64);
            assert!(window.as_slice().len() <= 10);
        }
        assert_eq!(*window.as_slice().last().unwrap(), 96.0);
    }

    #[test]
    fn test_record_success() {
        let store = StatsStore::new(1000);
        store.record_success("llama3", &terminal(42, 10, 0), 1.5);

        assert_eq!(store.request_counts()["llama3"], 1);
        assert_eq!(store.success_counts()["llama3"], 1);
        assert_eq!(store.failure_counts()["llama3"], 0);
        assert_eq!(store.token_counts()["llama3"], 42);
        assert_eq!(store.prompt_token_counts()["llama3"], 10);

        let durations = store.duration_stats();
        assert_eq!(durations["llama3"].avg, 1.5);
        // No load reported, so no load window
        assert!(store.load_duration_stats().is_empty());
    }

    #[test]
    fn test_load_duration_normalized_to_seconds() {
        let store = StatsStore::new(1000);
        store.record_success("llama3", &terminal(1, 1, 2_000_000_000), 3.0);
        store.record_success("llama3", &terminal(1, 1, 0), 0.5);

        let loads = store.load_duration_stats();
        assert_eq!(loads["llama3"].avg, 2.0);
        assert_eq!(loads["llama3"].max, 2.0);
    }

    #[test]
    fn test_record_failure_touches_counters_only() {
        let store = StatsStore::new(1000);
        store.record_failure("mistral");

        assert_eq!(store.request_counts()["mistral"], 1);
        assert_eq!(store.failure_counts()["mistral"], 1);
        assert_eq!(store.success_counts()["mistral"], 0);
        assert_eq!(store.token_counts()["mistral"], 0);
        assert!(store.duration_stats().is_empty());
        assert!(store.load_duration_stats().is_empty());
    }

    #[test]
    fn test_snapshots_are_independent() {
        let store = StatsStore::new(1000);
        store.record_failure("llama3");
        let before = store.request_counts();

        store.record_failure("llama3");
        store.record_failure("phi3");

        assert_eq!(before["llama3"], 1);
        assert!(!before.contains_key("phi3"));
        assert_eq!(store.request_counts()["llama3"], 2);
    }

    #[test]
    fn test_empty_store() {
        let store = StatsStore::new(1000);
        assert!(store.request_counts().is_empty());
        assert!(store.duration_stats().is_empty());
    }

    #[test]
    fn test_concurrent_recording_keeps_counts_consistent() {
        let store = Arc::new(StatsStore::new(100));
        let models = ["llama3", "mistral", "phi3"];

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..500 {
                        let model = models[(worker + i) % models.len()];
                        if i % 3 == 0 {
                            store.record_failure(model);
                        } else {
                            store.record_success(model, &terminal(2, 1, 1_000_000), 0.1);
                        }
                        // Readers interleave with writers
                        if i % 50 == 0 {
                            let _ = store.duration_stats();
                        }
                    }
                });
            }
        });

        let requests = store.request_counts();
        let successes = store.success_counts();
        let failures = store.failure_counts();
        let tokens = store.token_counts();

        assert_eq!(requests.values().sum::<u64>(), 8 * 500);
        for model in models {
            assert_eq!(requests[model], successes[model] + failures[model]);
            assert_eq!(tokens[model], successes[model] * 2);
        }
        for summary in store.duration_stats().values() {
            assert!((summary.avg - 0.1).abs() < 1e-9);
        }
    }
}
