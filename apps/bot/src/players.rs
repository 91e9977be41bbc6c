//! Per-guild playback registry. At most one playback is registered per guild;
//! stopping or replacing one waits until its workers have exited.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use playback::{PlaybackHandle, PlaybackOutcome, StopSignal};
use shared::domain::GuildId;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::debug;

struct Active {
    id: u64,
    stop: StopSignal,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
pub struct Players {
    next_id: AtomicU64,
    locks: Mutex<HashMap<GuildId, Arc<Mutex<()>>>>,
    active: Mutex<HashMap<GuildId, Active>>,
}

impl Players {
    /// Serializes commands touching one guild's voice connection.
    pub async fn lock(&self, guild_id: &GuildId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().await.entry(guild_id.clone()).or_default());
        lock.lock_owned().await
    }

    pub async fn is_playing(&self, guild_id: &GuildId) -> bool {
        self.active.lock().await.contains_key(guild_id)
    }

    /// Registers `handle` as the guild's playback, winding down whatever was
    /// registered before.
    ///
    /// The returned receiver yields the outcome only when the playback ends
    /// on its own while still registered. Stopping or replacing it drops the
    /// sender instead.
    pub async fn start(
        self: &Arc<Self>,
        guild_id: GuildId,
        handle: PlaybackHandle,
    ) -> oneshot::Receiver<PlaybackOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let (report_tx, report_rx) = oneshot::channel();

        let previous = self.active.lock().await.insert(
            guild_id.clone(),
            Active {
                id,
                stop: handle.stop_signal(),
                done: done_rx,
            },
        );

        let players = Arc::clone(self);
        let watched = guild_id.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            let _ = done_tx.send(());
            let mut active = players.active.lock().await;
            if active.get(&watched).is_some_and(|entry| entry.id == id) {
                active.remove(&watched);
                drop(active);
                let _ = report_tx.send(outcome);
            } else {
                debug!(guild_id = %watched, outcome = ?outcome, "superseded playback ended");
            }
        });

        if let Some(previous) = previous {
            wind_down(&guild_id, previous).await;
        }
        report_rx
    }

    /// `true` if a playback was registered.
    pub async fn stop(&self, guild_id: &GuildId) -> bool {
        let entry = self.active.lock().await.remove(guild_id);
        match entry {
            Some(entry) => {
                wind_down(guild_id, entry).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let entries: Vec<(GuildId, Active)> = self.active.lock().await.drain().collect();
        for (guild_id, entry) in entries {
            wind_down(&guild_id, entry).await;
        }
    }
}

async fn wind_down(guild_id: &GuildId, entry: Active) {
    entry.stop.stop();
    let _ = entry.done.await;
    debug!(guild_id = %guild_id, "previous playback ended");
}

#[cfg(test)]
#[path = "tests/players_tests.rs"]
mod tests;
