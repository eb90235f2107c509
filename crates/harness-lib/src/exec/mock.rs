//! Scriptable in-memory [`PodBackend`] for unit tests

use super::{ExecOutput, PodBackend, PodQuery, PodRef};
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type ExecHandler = Box<dyn Fn(&PodRef, &[String], usize) -> Result<ExecOutput> + Send + Sync>;
type LogHandler = Box<dyn Fn(&PodRef, Option<DateTime<Utc>>, usize) -> Result<String> + Send + Sync>;

pub(crate) struct MockPodBackend {
    find_failures: Mutex<HashMap<String, usize>>,
    exec_handler: ExecHandler,
    log_handler: LogHandler,
    pub finds: AtomicUsize,
    pub execs: AtomicUsize,
    pub log_calls: AtomicUsize,
    pub commands: Mutex<Vec<Vec<String>>>,
    pub log_since: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl MockPodBackend {
    pub fn new() -> Self {
        Self {
            find_failures: Mutex::new(HashMap::new()),
            exec_handler: Box::new(|_, _, _| Ok(ExecOutput::default())),
            log_handler: Box::new(|_, _, _| Ok(String::new())),
            finds: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            log_since: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `count` pod lookups on `node`
    pub fn failing_lookups(self, node: &str, count: usize) -> Self {
        self.find_failures
            .lock()
            .unwrap()
            .insert(node.to_string(), count);
        self
    }

    /// Handler receives the pod, argv and the zero-based exec call index
    pub fn on_exec<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PodRef, &[String], usize) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        self.exec_handler = Box::new(handler);
        self
    }

    /// Handler receives the pod, the `since` cursor and the zero-based log call index
    pub fn on_logs<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PodRef, Option<DateTime<Utc>>, usize) -> Result<String> + Send + Sync + 'static,
    {
        self.log_handler = Box::new(handler);
        self
    }

    pub fn stdout(text: &str) -> Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: text.as_bytes().to_vec(),
            stderr: String::new(),
        })
    }
}

/// Node name encoded in mock pod names (`<node>-pod`)
pub(crate) fn node_of(pod: &PodRef) -> &str {
    pod.name.strip_suffix("-pod").unwrap_or(&pod.name)
}

#[async_trait]
impl PodBackend for MockPodBackend {
    async fn find_pod(&self, query: &PodQuery, node: &str) -> Result<PodRef> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.find_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HarnessError::transient(
                    format!("locate pod on {}", node),
                    "no pod found",
                ));
            }
        }
        let mut pod = PodRef::new(&query.namespace, format!("{}-pod", node));
        pod.container = query.container.clone();
        Ok(pod)
    }

    async fn exec(&self, pod: &PodRef, argv: &[String]) -> Result<ExecOutput> {
        let index = self.execs.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(argv.to_vec());
        (self.exec_handler)(pod, argv, index)
    }

    async fn logs(&self, pod: &PodRef, since: Option<DateTime<Utc>>) -> Result<String> {
        let index = self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.log_since
            .lock()
            .unwrap()
            .push((pod.name.clone(), since));
        (self.log_handler)(pod, since, index)
    }
}
