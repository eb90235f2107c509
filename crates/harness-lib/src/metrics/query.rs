//! Typed PTP metric queries

use super::values::{ClockClass, ClockState, HaProfileStatus, InterfaceRole, MetricValue, ProcessStatus};
use super::PtpProcess;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// How a single label is constrained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelMatch {
    Equals(String),
    /// Any of the listed values
    Includes(Vec<String>),
    DoesNotEqual(String),
}

/// Label constraints, rendered in label-name order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter(BTreeMap<String, LabelMatch>);

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl LabelFilter {
    pub fn set(&mut self, label: impl Into<String>, matcher: LabelMatch) {
        self.0.insert(label.into(), matcher);
    }

    pub fn get(&self, label: &str) -> Option<&LabelMatch> {
        self.0.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LabelMatch)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// PromQL selector body, e.g. `node="n0",process=~"ptp4l|phc2sys"`
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(label, matcher)| match matcher {
                LabelMatch::Equals(v) => format!("{}={}", label, quote(v)),
                LabelMatch::DoesNotEqual(v) => format!("{}!={}", label, quote(v)),
                LabelMatch::Includes(values) => {
                    let alternatives: Vec<String> = values.iter().map(|v| regex::escape(v)).collect();
                    format!("{}=~{}", label, quote(&alternatives.join("|")))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An instant query over one PTP metric that decodes into `V`
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery<V: MetricValue> {
    metric: &'static str,
    filter: LabelFilter,
    _value: PhantomData<V>,
}

pub type ClockStateQuery = MetricQuery<ClockState>;
pub type InterfaceRoleQuery = MetricQuery<InterfaceRole>;
pub type ProcessStatusQuery = MetricQuery<ProcessStatus>;
pub type ClockClassQuery = MetricQuery<ClockClass>;
pub type HaProfileStatusQuery = MetricQuery<HaProfileStatus>;

impl<V: MetricValue> MetricQuery<V> {
    fn new(metric: &'static str) -> Self {
        Self {
            metric,
            filter: LabelFilter::default(),
            _value: PhantomData,
        }
    }

    pub fn label(mut self, label: &str, matcher: LabelMatch) -> Self {
        self.filter.set(label, matcher);
        self
    }

    pub fn node(self, node: &str) -> Self {
        self.label("node", LabelMatch::Equals(node.to_string()))
    }

    pub fn process(self, process: PtpProcess) -> Self {
        self.label("process", LabelMatch::Equals(process.as_str().to_string()))
    }

    pub fn processes(self, processes: &[PtpProcess]) -> Self {
        let values = processes.iter().map(|p| p.as_str().to_string()).collect();
        self.label("process", LabelMatch::Includes(values))
    }

    pub fn interface(self, interface: &str) -> Self {
        self.label("iface", LabelMatch::Equals(interface.to_string()))
    }

    pub fn metric(&self) -> &'static str {
        self.metric
    }

    pub fn filter(&self) -> &LabelFilter {
        &self.filter
    }

    pub fn promql(&self) -> String {
        format!("{}{{{}}}", self.metric, self.filter.render())
    }

    pub fn parse(&self, sample: f64) -> Option<V> {
        V::from_sample(sample)
    }
}

impl ClockStateQuery {
    pub fn clock_state() -> Self {
        Self::new("openshift_ptp_clock_state")
    }
}

impl InterfaceRoleQuery {
    pub fn interface_role() -> Self {
        Self::new("openshift_ptp_interface_role")
    }
}

impl ProcessStatusQuery {
    pub fn process_status() -> Self {
        Self::new("openshift_ptp_process_status")
    }

    pub fn config(self, config: &str) -> Self {
        self.label("config", LabelMatch::Equals(config.to_string()))
    }
}

impl ClockClassQuery {
    pub fn clock_class() -> Self {
        Self::new("openshift_ptp_clock_class")
    }
}

impl HaProfileStatusQuery {
    pub fn ha_profile_status() -> Self {
        Self::new("openshift_ptp_ha_profile_status")
    }

    pub fn profile(self, profile: &str) -> Self {
        self.label("profile", LabelMatch::Equals(profile.to_string()))
    }
}
