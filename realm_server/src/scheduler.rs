//! Timers.
//!
//! Timers never touch registry state. They only post events to the hub,
//! which re-checks that the world or player still exists before acting.
//! - World tick: one per populated world, period = the world's physics step.
//! - Lobby tick: one per process, for players outside any world.
//! - Grace timer: one per disconnected player still controlling an entity.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use realm_shared::ids::{ConnectionId, WorldId};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::HubEvent;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A running periodic task. Dropping the handle stops it.
///
/// Ticks already queued when the task is aborted can still reach the hub,
/// so world ticks carry the generation of the handle that produced them.
#[derive(Debug)]
pub struct TickHandle {
    task: JoinHandle<()>,
    generation: u64,
}

impl TickHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_periodic(
    period: Duration,
    events: mpsc::Sender<HubEvent>,
    generation: u64,
    make: impl Fn() -> HubEvent + Send + 'static,
) -> TickHandle {
    let period = period.max(Duration::from_millis(1));
    let task = tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if events.send(make()).await.is_err() {
                break;
            }
        }
    });
    TickHandle { task, generation }
}

/// Starts the tick of one world.
pub fn spawn_world_tick(
    world: WorldId,
    period: Duration,
    events: mpsc::Sender<HubEvent>,
) -> TickHandle {
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    debug!(
        world = %world,
        generation,
        period_ms = period.as_millis() as u64,
        "world tick started"
    );
    spawn_periodic(period, events, generation, move || HubEvent::WorldTick {
        world: world.clone(),
        generation,
    })
}

pub fn spawn_lobby_tick(period: Duration, events: mpsc::Sender<HubEvent>) -> TickHandle {
    spawn_periodic(period, events, 0, || HubEvent::LobbyTick)
}

/// Deadline for tearing down a disconnected player.
///
/// Fires `HubEvent::GraceExpired` once the window elapses unless cancelled
/// first. Dropping the timer cancels it.
#[derive(Debug)]
pub struct GraceTimer {
    cancel: CancellationToken,
    deadline: Instant,
}

impl GraceTimer {
    pub fn start(
        connection: ConnectionId,
        window: Duration,
        events: mpsc::Sender<HubEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let deadline = Instant::now() + window;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep_until(deadline) => {
                    let _ = events.send(HubEvent::GraceExpired(connection)).await;
                }
            }
        });
        Self { cancel, deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for GraceTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn world_tick_stops_when_dropped() {
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_world_tick(WorldId::new("World_a"), Duration::from_millis(50), tx);
        let generation = handle.generation();

        time::sleep(Duration::from_millis(120)).await;
        let mut ticks = 0;
        while let Ok(ev) = rx.try_recv() {
            assert!(matches!(
                ev,
                HubEvent::WorldTick { ref world, generation: g }
                    if world.as_str() == "World_a" && g == generation
            ));
            ticks += 1;
        }
        assert_eq!(ticks, 2);

        drop(handle);
        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_fires_at_deadline() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = GraceTimer::start(ConnectionId::new("soc_1"), Duration::from_millis(4500), tx);

        time::sleep(Duration::from_millis(4490)).await;
        assert!(rx.try_recv().is_err());

        time::sleep(Duration::from_millis(20)).await;
        match rx.try_recv() {
            Ok(HubEvent::GraceExpired(conn)) => assert_eq!(conn.as_str(), "soc_1"),
            other => panic!("unexpected {other:?}"),
        }
        drop(timer);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_grace_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let timer = GraceTimer::start(ConnectionId::new("soc_2"), Duration::from_millis(100), tx);
        drop(timer);
        time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
