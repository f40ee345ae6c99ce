//! Blocking HTTP client for smart plugs running Tasmota firmware.
//!
//! - Uses the `cm` command endpoint: `GET /cm?cmnd=Power%20On`.
//! - The plug answers with its resulting relay state, e.g. `{"POWER":"ON"}`;
//!   multi-relay plugs report `POWER1`.
//! - Every request is bounded by the agent's global timeout, so an
//!   unreachable plug fails fast instead of stalling a control loop.

use crate::devices::actuator::{ActuationError, Actuator};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct PowerReply {
    #[serde(alias = "POWER1")]
    #[serde(rename = "POWER")]
    power: String,
}

pub struct TasmotaPlug {
    agent: ureq::Agent,
    base_url: String,
}

impl core::fmt::Debug for TasmotaPlug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TasmotaPlug").field("base_url", &self.base_url).finish()
    }
}

impl TasmotaPlug {
    pub fn new(host: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        TasmotaPlug { agent, base_url }
    }

    fn command(&self, command: &str) -> Result<PowerReply, ActuationError> {
        let url = format!("{}/cm", self.base_url);
        match self.agent.get(&url).query("cmnd", command).call() {
            Ok(mut res) => Ok(serde_json::from_reader(res.body_mut().as_reader())?),
            Err(ureq::Error::StatusCode(status)) => Err(ActuationError::Http { status }),
            Err(ureq::Error::Timeout(_)) => Err(ActuationError::Timeout),
            Err(e) => Err(ActuationError::Transport(e.to_string())),
        }
    }
}

impl Actuator for TasmotaPlug {
    fn set_state(&self, on: bool) -> Result<(), ActuationError> {
        let reply = self.command(if on { "Power On" } else { "Power Off" })?;
        check_reply(&reply.power, on)
    }
}

fn check_reply(power: &str, requested_on: bool) -> Result<(), ActuationError> {
    let expected = if requested_on { "ON" } else { "OFF" };
    if power.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(ActuationError::Protocol(format!("asked for {}, plug reports {}", expected, power)))
    }
}
