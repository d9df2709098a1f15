use std::env;
use std::thread;

use tracing::{debug, warn};

/// Identifying string of the host the viewer runs in.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub identifier: String,
}

impl HostEnvironment {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn detect() -> Self {
        let program = env::var("TERM_PROGRAM").unwrap_or_default();
        let term = env::var("TERM").unwrap_or_default();
        Self::new(format!("{} {} {}", env::consts::OS, program, term).trim().to_string())
    }
}

/// Decides whether page decoding may run on a background worker.
#[derive(Debug, Clone, Default)]
pub struct CapabilityProber {
    denylist: Vec<String>,
}

impl CapabilityProber {
    pub fn new(denylist: Vec<String>) -> Self {
        let denylist = denylist
            .into_iter()
            .map(|entry| entry.trim().to_ascii_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { denylist }
    }

    /// Best effort and never panics. Evaluated on every load attempt; nothing is cached.
    pub fn can_use_background_decode_worker(&self, host: &HostEnvironment) -> bool {
        let identifier = host.identifier.to_ascii_lowercase();
        if let Some(entry) = self.denylist.iter().find(|entry| identifier.contains(entry.as_str())) {
            debug!(host = %host.identifier, entry = %entry, "host is denylisted for worker decoding");
            return false;
        }
        spawn_probe_worker()
    }
}

fn spawn_probe_worker() -> bool {
    const TOKEN: u32 = 0x5eed;
    let spawned = thread::Builder::new()
        .name("folio-decode-probe".into())
        .spawn(|| TOKEN);
    match spawned {
        Ok(worker) => match worker.join() {
            Ok(value) => value == TOKEN,
            Err(_) => {
                warn!("decode probe worker panicked");
                false
            }
        },
        Err(err) => {
            warn!(?err, "failed to spawn decode probe worker");
            false
        }
    }
}
