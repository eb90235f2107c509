//! PtpConfig snapshots, targeted profile edits and restoration
//!
//! Every edit re-reads the live object and writes it back with the live
//! resourceVersion. A write that loses an optimistic-concurrency race is
//! retried against a fresh read.

use super::store::{is_conflict, PtpConfigApi};
use super::topology::ProfileReference;
use crate::crds::{PtpConfig, PtpProfile};
use crate::error::{HarnessError, Result};
use crate::logs::{LineMatcher, LogTailer, TailOptions};
use crate::observability::{HarnessMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const UPDATE_ATTEMPTS: usize = 3;

/// Line the daemon logs after (re)loading its profiles
pub const PROFILE_LOAD_MARKER: &str = "load profiles";

fn holdover_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--ts2phc\.holdover(=|\s+)(\d+)").expect("holdover regex is valid"))
}

/// Set `--ts2phc.holdover=<seconds>` in a ts2phc option string
pub fn set_ts2phc_holdover(opts: Option<&str>, seconds: u64) -> String {
    let replacement = format!("--ts2phc.holdover={}", seconds);
    match opts.map(str::trim).filter(|o| !o.is_empty()) {
        None => replacement,
        Some(opts) if holdover_regex().is_match(opts) => {
            holdover_regex().replace_all(opts, replacement.as_str()).into_owned()
        }
        Some(opts) => format!("{} {}", opts, replacement),
    }
}

/// Drop every `server` line of a chrony config and add `server <server> iburst`
pub fn replace_chronyd_servers(conf: Option<&str>, server: &str) -> String {
    let mut lines: Vec<String> = conf
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim_start().starts_with("server"))
        .map(str::to_string)
        .collect();
    lines.push(format!("server {} iburst", server));
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Set `ptpSettings.logReduce` on every profile; returns whether anything changed
pub fn set_log_reduce(config: &mut PtpConfig, value: &str) -> bool {
    let mut changed = false;
    for profile in &mut config.spec.profile {
        let settings = profile.ptp_settings.get_or_insert_with(Default::default);
        if settings.get("logReduce").map(String::as_str) != Some(value) {
            settings.insert("logReduce".to_string(), value.to_string());
            changed = true;
        }
    }
    changed
}

/// Remove the named profile and every recommend that points at it
pub fn remove_profile(config: &mut PtpConfig, name: &str) -> Option<PtpProfile> {
    let index = config.spec.profile.iter().position(|p| p.name() == name)?;
    let removed = config.spec.profile.remove(index);
    config
        .spec
        .recommend
        .retain(|recommend| recommend.profile.as_deref() != Some(name));
    Some(removed)
}

/// The profile `reference` points at, checking that the name still matches
fn referenced_profile<'a>(config: &'a mut PtpConfig, reference: &ProfileReference) -> Result<&'a mut PtpProfile> {
    match config.spec.profile.get_mut(reference.profile_index) {
        Some(profile) if profile.name() == reference.profile_name => Ok(profile),
        _ => Err(HarnessError::Contract(format!(
            "profile {} is no longer at index {} of {}/{}",
            reference.profile_name, reference.profile_index, reference.config_namespace, reference.config_name
        ))),
    }
}

/// Applies edits to live PtpConfigs and restores them from snapshots
#[derive(Clone)]
pub struct ProfileMutator {
    api: Arc<dyn PtpConfigApi>,
    metrics: HarnessMetrics,
    logger: StructuredLogger,
}

impl ProfileMutator {
    pub fn new(api: Arc<dyn PtpConfigApi>, logger: StructuredLogger) -> Self {
        Self {
            api,
            metrics: HarnessMetrics::new(),
            logger,
        }
    }

    /// Deep copy of every PtpConfig
    pub async fn save_ptp_configs(&self) -> Result<Vec<PtpConfig>> {
        let configs = self.api.list().await?;
        info!(count = configs.len(), "Saved PtpConfig snapshot");
        Ok(configs)
    }

    /// Read-modify-write with conflict retries; `mutate` returns `None` to skip the write
    async fn update_config<T, F>(&self, namespace: &str, name: &str, mut mutate: F) -> Result<Option<T>>
    where
        F: FnMut(&mut PtpConfig) -> Result<Option<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut live = self.api.get(namespace, name).await?;
            let Some(value) = mutate(&mut live)? else {
                return Ok(None);
            };
            match self.api.replace(&live).await {
                Ok(_) => return Ok(Some(value)),
                Err(e) if is_conflict(&e) && attempt < UPDATE_ATTEMPTS => {
                    debug!(config = %name, attempt = attempt, "PtpConfig update conflicted, retrying");
                }
                Err(e) => return Err(e.context("update PtpConfig", &format!("{}/{}", namespace, name))),
            }
        }
    }

    /// Apply `edit` to the referenced profile; returns the profile as it was before
    pub async fn mutate_profile<F>(&self, reference: &ProfileReference, mut edit: F) -> Result<PtpProfile>
    where
        F: FnMut(&mut PtpProfile),
    {
        let previous = self
            .update_config(&reference.config_namespace, &reference.config_name, |config| {
                let profile = referenced_profile(config, reference)?;
                let before = profile.clone();
                edit(profile);
                Ok(Some(before))
            })
            .await?;
        previous.ok_or_else(|| HarnessError::Contract("profile update produced no snapshot".to_string()))
    }

    pub async fn update_ts2phc_holdover(&self, reference: &ProfileReference, seconds: u64) -> Result<PtpProfile> {
        self.logger
            .log_perturbation(&reference.profile_name, &format!("ts2phc holdover {}s", seconds));
        self.mutate_profile(reference, |profile| {
            profile.ts2phc_opts = Some(set_ts2phc_holdover(profile.ts2phc_opts.as_deref(), seconds));
        })
        .await
    }

    pub async fn update_chronyd_servers(&self, reference: &ProfileReference, server: &str) -> Result<PtpProfile> {
        self.logger
            .log_perturbation(&reference.profile_name, &format!("chronyd server {}", server));
        self.mutate_profile(reference, |profile| {
            profile.chronyd_conf = Some(replace_chronyd_servers(profile.chronyd_conf.as_deref(), server));
        })
        .await
    }

    /// Put a single profile back to a saved copy
    pub async fn restore_profile(&self, reference: &ProfileReference, saved: &PtpProfile) -> Result<()> {
        self.mutate_profile(reference, |profile| *profile = saved.clone())
            .await
            .map(|_| ())
    }

    /// Put a single profile back and wait for `nodes` to reload it
    pub async fn restore_profile_and_wait(
        &self,
        reference: &ProfileReference,
        saved: &PtpProfile,
        tailer: &LogTailer,
        nodes: &[String],
        timeout: Duration,
    ) -> Result<()> {
        let since = Utc::now();
        self.restore_profile(reference, saved).await?;
        wait_for_profile_load(tailer, nodes, since, timeout).await
    }

    /// Set `logReduce` on every profile of every config; returns whether any config changed
    pub async fn update_log_reduce(&self, value: &str) -> Result<bool> {
        let mut any_changed = false;
        for config in self.api.list().await? {
            let namespace = config.namespace().unwrap_or_default();
            let name = config.name_any();
            let changed = self
                .update_config(&namespace, &name, |live| Ok(set_log_reduce(live, value).then_some(())))
                .await?;
            any_changed |= changed.is_some();
        }
        Ok(any_changed)
    }

    /// Remove a profile and its orphaned recommends from the live config
    pub async fn remove_profile(&self, namespace: &str, config: &str, profile: &str) -> Result<Option<PtpProfile>> {
        self.update_config(namespace, config, |live| Ok(remove_profile(live, profile)))
            .await
    }

    /// Overwrite live configs that differ from `saved`
    ///
    /// Returns references to every profile that was rewritten. Failures on
    /// individual configs are collected and joined.
    pub async fn restore_ptp_configs(&self, saved: &[PtpConfig]) -> Result<Vec<ProfileReference>> {
        let mut changed_refs = Vec::new();
        let mut errors = Vec::new();

        for snapshot in saved {
            let namespace = snapshot.namespace().unwrap_or_default();
            let name = snapshot.name_any();

            let result = self
                .update_config(&namespace, &name, |live| {
                    if live.spec == snapshot.spec {
                        return Ok(None);
                    }
                    let changed: Vec<ProfileReference> = snapshot
                        .spec
                        .profile
                        .iter()
                        .enumerate()
                        .filter(|(index, profile)| live.spec.profile.get(*index) != Some(*profile))
                        .map(|(index, profile)| ProfileReference {
                            config_namespace: namespace.clone(),
                            config_name: name.clone(),
                            profile_index: index,
                            profile_name: profile.name().to_string(),
                        })
                        .collect();
                    live.spec = snapshot.spec.clone();
                    Ok(Some(changed))
                })
                .await;

            match result {
                Ok(Some(refs)) => changed_refs.extend(refs),
                Ok(None) => {}
                Err(e) => {
                    warn!(config = %name, error = %e, "Failed to restore PtpConfig");
                    errors.push(e);
                }
            }
        }

        let names: Vec<String> = changed_refs.iter().map(|r| r.profile_name.clone()).collect();
        self.metrics.add_profiles_restored(names.len() as u64);
        self.logger.log_profiles_restored(&names);

        HarnessError::join(errors)?;
        Ok(changed_refs)
    }
}

/// Wait for every node in `nodes` to log a profile reload after `since`
pub async fn wait_for_profile_load(
    tailer: &LogTailer,
    nodes: &[String],
    since: DateTime<Utc>,
    timeout: Duration,
) -> Result<()> {
    let options = TailOptions::new(LineMatcher::contains(PROFILE_LOAD_MARKER))
        .start_time(since)
        .timeout(timeout);
    tailer.wait_for_log_on_nodes(nodes, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::PtpConfigSpec;
    use crate::exec::mock::MockPodBackend;
    use crate::exec::PodQuery;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryApi {
        configs: Mutex<HashMap<String, PtpConfig>>,
        conflicts_left: Mutex<usize>,
        writes: Mutex<usize>,
    }

    impl InMemoryApi {
        fn with(configs: Vec<PtpConfig>) -> Arc<Self> {
            let api = InMemoryApi::default();
            for config in configs {
                api.configs.lock().unwrap().insert(config.name_any(), config);
            }
            Arc::new(api)
        }

        fn snapshot(&self, name: &str) -> PtpConfig {
            self.configs.lock().unwrap()[name].clone()
        }
    }

    #[async_trait]
    impl PtpConfigApi for InMemoryApi {
        async fn list(&self) -> Result<Vec<PtpConfig>> {
            let mut configs: Vec<PtpConfig> = self.configs.lock().unwrap().values().cloned().collect();
            configs.sort_by_key(|c| c.name_any());
            Ok(configs)
        }

        async fn get(&self, _namespace: &str, name: &str) -> Result<PtpConfig> {
            self.configs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::Precondition(format!("{} not found", name)))
        }

        async fn replace(&self, config: &PtpConfig) -> Result<PtpConfig> {
            let mut conflicts = self.conflicts_left.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(HarnessError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".into(),
                    message: "the object has been modified".into(),
                    reason: "Conflict".into(),
                    code: 409,
                })));
            }
            *self.writes.lock().unwrap() += 1;
            self.configs
                .lock()
                .unwrap()
                .insert(config.name_any(), config.clone());
            Ok(config.clone())
        }
    }

    fn config(name: &str, spec: serde_json::Value) -> PtpConfig {
        let spec: PtpConfigSpec = serde_json::from_value(spec).unwrap();
        let mut config = PtpConfig::new(name, spec);
        config.metadata.namespace = Some("openshift-ptp".into());
        config
    }

    fn gm_config() -> PtpConfig {
        config(
            "gm",
            json!({
                "profile": [
                    {"name": "gm", "ts2phcOpts": "-s generic --ts2phc.holdover 5", "ts2phcConf": "[global]"},
                    {"name": "fallback", "chronydConf": "driftfile /var/lib/chrony/drift\nserver a.example iburst\n  server b.example\nmakestep 1.0 3\n"}
                ],
                "recommend": [
                    {"profile": "gm", "priority": 4, "match": [{"nodeName": "n0"}]},
                    {"profile": "fallback", "priority": 4, "match": [{"nodeName": "n1"}]}
                ]
            }),
        )
    }

    fn reference(index: usize, name: &str) -> ProfileReference {
        ProfileReference {
            config_namespace: "openshift-ptp".into(),
            config_name: "gm".into(),
            profile_index: index,
            profile_name: name.into(),
        }
    }

    #[test]
    fn test_holdover_replace_append_create() {
        assert_eq!(set_ts2phc_holdover(Some("-s generic --ts2phc.holdover 5"), 10), "-s generic --ts2phc.holdover=10");
        assert_eq!(set_ts2phc_holdover(Some("--ts2phc.holdover=5 -m"), 7), "--ts2phc.holdover=7 -m");
        assert_eq!(set_ts2phc_holdover(Some("-s generic"), 3), "-s generic --ts2phc.holdover=3");
        assert_eq!(set_ts2phc_holdover(None, 3), "--ts2phc.holdover=3");
    }

    #[test]
    fn test_holdover_set_twice_equals_set_once() {
        let opts = Some("-s generic --ts2phc.holdover 5");
        let twice = set_ts2phc_holdover(Some(&set_ts2phc_holdover(opts, 10)), 20);
        assert_eq!(twice, set_ts2phc_holdover(opts, 20));
    }

    #[test]
    fn test_chronyd_servers_replaced() {
        let conf = "driftfile x\nserver a iburst\n  server b\nmakestep 1.0 3\n";
        let once = replace_chronyd_servers(Some(conf), "c");
        assert_eq!(once, "driftfile x\nmakestep 1.0 3\nserver c iburst\n");

        let twice = replace_chronyd_servers(Some(&replace_chronyd_servers(Some(conf), "d")), "c");
        assert_eq!(twice, once);
    }

    #[test]
    fn test_remove_profile_drops_orphan_recommends() {
        let mut config = gm_config();
        let removed = remove_profile(&mut config, "fallback").unwrap();

        assert_eq!(removed.name(), "fallback");
        assert_eq!(config.spec.profile.len(), 1);
        assert!(config
            .spec
            .recommend
            .iter()
            .all(|r| r.profile.as_deref() != Some("fallback")));
        assert!(remove_profile(&mut config, "missing").is_none());
    }

    #[test]
    fn test_set_log_reduce_reports_change() {
        let mut config = gm_config();
        assert!(set_log_reduce(&mut config, "true"));
        assert!(!set_log_reduce(&mut config, "true"));
        assert_eq!(
            config.spec.profile[1].ptp_settings.as_ref().unwrap()["logReduce"],
            "true"
        );
    }

    #[tokio::test]
    async fn test_save_mutate_restore_round_trip() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api.clone(), StructuredLogger::new("test"));

        let saved = mutator.save_ptp_configs().await.unwrap();
        let before = mutator.update_ts2phc_holdover(&reference(0, "gm"), 10).await.unwrap();
        assert_eq!(before.ts2phc_opts.as_deref(), Some("-s generic --ts2phc.holdover 5"));
        mutator.update_chronyd_servers(&reference(1, "fallback"), "10.0.0.1").await.unwrap();
        assert_ne!(api.snapshot("gm").spec, saved[0].spec);

        let changed = mutator.restore_ptp_configs(&saved).await.unwrap();

        assert_eq!(api.snapshot("gm").spec, saved[0].spec);
        let names: Vec<&str> = changed.iter().map(|r| r.profile_name.as_str()).collect();
        assert_eq!(names, vec!["gm", "fallback"]);

        // restoring an unchanged cluster writes nothing
        let writes = *api.writes.lock().unwrap();
        assert!(mutator.restore_ptp_configs(&saved).await.unwrap().is_empty());
        assert_eq!(*api.writes.lock().unwrap(), writes);
    }

    #[tokio::test]
    async fn test_targeted_restore_and_stale_reference() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api.clone(), StructuredLogger::new("test"));

        let before = mutator.update_ts2phc_holdover(&reference(0, "gm"), 10).await.unwrap();
        mutator.restore_profile(&reference(0, "gm"), &before).await.unwrap();
        assert_eq!(api.snapshot("gm").spec.profile[0], before);

        let err = mutator
            .update_ts2phc_holdover(&reference(1, "gm"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Contract(_)));
    }

    fn daemon_tailer(backend: Arc<MockPodBackend>) -> LogTailer {
        LogTailer::new(
            backend,
            PodQuery::new("openshift-ptp", "app=linuxptp-daemon").with_container("linuxptp-daemon-container"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_profile_waits_for_reload() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api.clone(), StructuredLogger::new("test"));
        let backend = Arc::new(
            MockPodBackend::new().on_logs(|_, _, _| Ok("ptp4l[1.0]: load profiles\n".to_string())),
        );

        let before = mutator.update_ts2phc_holdover(&reference(0, "gm"), 10).await.unwrap();
        mutator
            .restore_profile_and_wait(
                &reference(0, "gm"),
                &before,
                &daemon_tailer(backend.clone()),
                &["n0".to_string()],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(api.snapshot("gm").spec.profile[0], before);
        assert_eq!(backend.log_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restore_skips_reload_wait() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api, StructuredLogger::new("test"));
        let backend = Arc::new(MockPodBackend::new());
        let saved = gm_config().spec.profile[0].clone();

        let err = mutator
            .restore_profile_and_wait(
                &reference(1, "gm"),
                &saved,
                &daemon_tailer(backend.clone()),
                &["n0".to_string()],
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Contract(_)));
        assert_eq!(backend.log_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_fails_when_reload_never_logged() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api.clone(), StructuredLogger::new("test"));
        let backend = Arc::new(MockPodBackend::new().on_logs(|_, _, _| Ok("ptp4l[1.0]: rms 3\n".to_string())));

        let before = mutator.update_ts2phc_holdover(&reference(0, "gm"), 10).await.unwrap();
        let err = mutator
            .restore_profile_and_wait(
                &reference(0, "gm"),
                &before,
                &daemon_tailer(backend),
                &["n0".to_string()],
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(api.snapshot("gm").spec.profile[0], before);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let api = InMemoryApi::with(vec![gm_config()]);
        *api.conflicts_left.lock().unwrap() = 2;
        let mutator = ProfileMutator::new(api.clone(), StructuredLogger::new("test"));

        assert!(mutator.update_log_reduce("true").await.unwrap());
        assert_eq!(*api.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_joins_errors() {
        let api = InMemoryApi::with(vec![gm_config()]);
        let mutator = ProfileMutator::new(api, StructuredLogger::new("test"));
        let missing = vec![config("gone-a", json!({})), config("gone-b", json!({}))];

        let err = mutator.restore_ptp_configs(&missing).await.unwrap_err();
        assert!(err.to_string().contains("2 errors occurred"));
    }
}
