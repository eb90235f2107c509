//! Clock state assertion command

use anyhow::Result;
use chrono::Utc;
use clap::ValueEnum;
use harness_lib::metrics::{AssertOptions, ClockState, ClockStateQuery};
use harness_lib::Harness;
use std::time::Duration;

use crate::output::{print_info, print_success};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Locked,
    Freerun,
    Holdover,
}

impl From<StateArg> for ClockState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Locked => ClockState::Locked,
            StateArg::Freerun => ClockState::Freerun,
            StateArg::Holdover => ClockState::Holdover,
        }
    }
}

/// Wait until every clock state series of `node` equals `state` for `stable_for_secs`
pub async fn assert_clock_state(
    harness: &Harness,
    node: &str,
    state: StateArg,
    stable_for_secs: u64,
    timeout_secs: u64,
) -> Result<()> {
    let asserter = harness.metric_asserter().await?;
    let query = ClockStateQuery::clock_state().node(node);
    let options = AssertOptions::default()
        .start_time(Utc::now())
        .stable_for(Duration::from_secs(stable_for_secs))
        .timeout(Duration::from_secs(timeout_secs));

    print_info(&format!("Waiting for {} == {:?}", query.promql(), state));
    asserter.assert_query(&query, state.into(), &options).await?;
    print_success(&format!("{} is {:?}", node, state));
    Ok(())
}
