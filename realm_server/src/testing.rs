//! Test doubles shared by the server's unit tests: a transport that records
//! what it would have sent and a scripted world simulation.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use realm_shared::{
    codec::Frame,
    config::{ServerConfig, TransportKind},
    ids::{ConnectionId, UserId, WorldId},
    math::Vec3,
    protocol::{ControlsPayload, ReplyTo, ServerEvent},
    sim::{ScenarioInfo, SpawnSlot, WorldFactory, WorldSim},
    snapshot::{EntityKind, EntityState, SunConfig},
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::{
    hub::HubEvent,
    session::{Session, LIFECYCLE_CAPACITY},
    transport::{Audience, Transport},
};

pub const STUB_MAP: &str = "stub_map";

/// One thing the session asked the transport to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event {
        to: ConnectionId,
        event: ServerEvent,
    },
    Reply {
        to: ConnectionId,
        reply: ReplyTo,
        payload: Value,
    },
    Close {
        to: ConnectionId,
        code: u16,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Delivery>>>);

impl Recorder {
    fn record(&self, delivery: Delivery) {
        self.0.lock().unwrap().push(delivery);
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    recorder: Recorder,
    attached: BTreeSet<ConnectionId>,
}

impl RecordingTransport {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            attached: BTreeSet::new(),
        }
    }
}

impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Manual
    }

    fn attach(&mut self, connection: ConnectionId, _outbox: mpsc::Sender<Frame>) {
        self.attached.insert(connection);
    }

    fn detach(&mut self, connection: &ConnectionId) {
        self.attached.remove(connection);
    }

    fn send_to(&mut self, connection: &ConnectionId, event: &ServerEvent) {
        self.recorder.record(Delivery::Event {
            to: connection.clone(),
            event: event.clone(),
        });
    }

    fn broadcast(&mut self, audience: Audience<'_>, event: &ServerEvent) {
        for member in audience.members {
            self.send_to(member, event);
        }
    }

    fn join_group(&mut self, _connection: &ConnectionId, _group: &WorldId) {}

    fn leave_group(&mut self, _connection: &ConnectionId, _group: &WorldId) {}

    fn reply(&mut self, connection: &ConnectionId, to: ReplyTo, payload: Value) {
        self.recorder.record(Delivery::Reply {
            to: connection.clone(),
            reply: to,
            payload,
        });
    }

    fn close(&mut self, connection: &ConnectionId, code: u16, reason: &str) {
        self.recorder.record(Delivery::Close {
            to: connection.clone(),
            code,
            reason: reason.to_string(),
        });
        self.attached.remove(connection);
    }

    fn close_all(&mut self, code: u16, reason: &str) {
        let all: Vec<ConnectionId> = self.attached.iter().cloned().collect();
        for connection in &all {
            self.close(connection, code, reason);
        }
    }
}

/// Knobs and counters shared by every stub world of one harness.
#[derive(Debug, Default)]
pub struct StubState {
    controlling: AtomicBool,
    release_completes: AtomicBool,
    releasing: AtomicBool,
    releases: AtomicUsize,
    spawns: AtomicUsize,
    controls: AtomicUsize,
    updates: AtomicUsize,
}

impl StubState {
    pub fn set_controlling(&self, on: bool) {
        self.controlling.store(on, Ordering::SeqCst);
    }

    pub fn set_release_completes(&self, on: bool) {
        self.release_completes.store(on, Ordering::SeqCst);
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn controls_applied(&self) -> usize {
        self.controls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

pub struct StubSim {
    state: Arc<StubState>,
    characters: BTreeSet<UserId>,
    scenario: Option<String>,
    entities: Vec<EntityState>,
    panic_on_controls: bool,
}

impl StubSim {
    fn new(state: Arc<StubState>) -> Self {
        Self {
            state,
            characters: BTreeSet::new(),
            scenario: None,
            entities: vec![EntityState::new(
                "prop_1",
                EntityKind::Prop,
                Vec3::new(1.0, 0.0, 1.0),
            )],
            panic_on_controls: false,
        }
    }
}

impl WorldSim for StubSim {
    fn update(&mut self, _dt: f32) {
        self.state.updates.fetch_add(1, Ordering::SeqCst);
        if self.state.releasing.load(Ordering::SeqCst)
            && self.state.release_completes.load(Ordering::SeqCst)
        {
            self.state.set_controlling(false);
        }
    }

    fn map_names(&self) -> Vec<String> {
        vec![STUB_MAP.to_string()]
    }

    fn launch_map(&mut self, name: &str) -> bool {
        if name != STUB_MAP {
            return false;
        }
        self.scenario = Some("default".into());
        true
    }

    fn launch_scenario(&mut self, name: &str) -> bool {
        if name != "default" {
            return false;
        }
        self.scenario = Some(name.into());
        true
    }

    fn last_map_id(&self) -> Option<String> {
        self.scenario.as_ref().map(|_| STUB_MAP.to_string())
    }

    fn last_scenario_id(&self) -> Option<String> {
        self.scenario.clone()
    }

    fn scenarios(&self) -> Vec<ScenarioInfo> {
        vec![ScenarioInfo {
            name: "default".into(),
            spawn: Some(SpawnSlot {
                origin: Vec3::ZERO,
                spacing: 2.0,
                columns: 4,
            }),
            initial_camera_angle: 90.0,
        }]
    }

    fn physics_frame_time(&self) -> f32 {
        0.05
    }

    fn time_scale_target(&self) -> f32 {
        1.0
    }

    fn sun(&self) -> SunConfig {
        SunConfig::default()
    }

    fn add_user(&mut self, user: &UserId, _spawn: Option<Vec3>) {
        self.state.spawns.fetch_add(1, Ordering::SeqCst);
        self.characters.insert(user.clone());
    }

    fn remove_user(&mut self, user: &UserId) {
        self.characters.remove(user);
    }

    fn has_character(&self, user: &UserId) -> bool {
        self.characters.contains(user)
    }

    fn is_controlling(&self, _user: &UserId) -> bool {
        self.state.controlling.load(Ordering::SeqCst)
    }

    fn release_control(&mut self, _user: &UserId) {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        self.state.releasing.store(true, Ordering::SeqCst);
    }

    fn apply_controls(&mut self, _user: &UserId, _controls: &ControlsPayload) {
        if self.panic_on_controls {
            panic!("stub simulation rejected input");
        }
        self.state.controls.fetch_add(1, Ordering::SeqCst);
    }

    fn entities_mut(&mut self) -> Box<dyn Iterator<Item = &mut EntityState> + '_> {
        Box::new(self.entities.iter_mut())
    }
}

#[derive(Debug, Default)]
pub struct StubFactory {
    pub state: Arc<StubState>,
}

impl WorldFactory for StubFactory {
    fn create(&self, _world: &WorldId) -> Box<dyn WorldSim> {
        Box::new(StubSim::new(self.state.clone()))
    }
}

/// Builds worlds whose simulation panics on player input.
#[derive(Debug, Default)]
pub struct PanickingFactory;

impl WorldFactory for PanickingFactory {
    fn create(&self, _world: &WorldId) -> Box<dyn WorldSim> {
        let mut sim = StubSim::new(Arc::default());
        sim.panic_on_controls = true;
        Box::new(sim)
    }
}

pub struct Harness {
    pub session: Session,
    pub events: mpsc::Receiver<HubEvent>,
    pub recorder: Recorder,
    pub stub: Arc<StubState>,
    outboxes: Vec<mpsc::Receiver<Frame>>,
}

impl Harness {
    pub fn connect(&mut self, id: &str) -> ConnectionId {
        let connection = ConnectionId::new(id);
        let (outbox, frames) = mpsc::channel(8);
        self.outboxes.push(frames);
        self.session.on_connect(connection.clone(), outbox);
        connection
    }

    pub fn confirm(&mut self, connection: &ConnectionId, user: &str) {
        self.session.confirm_identity(connection, UserId::new(user));
    }
}

/// A session over the recording transport and stub worlds. Needs a runtime.
pub fn harness(config: ServerConfig) -> Harness {
    let (tx, events) = mpsc::channel(config.queue_depth);
    let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
    let recorder = Recorder::default();
    let factory = StubFactory::default();
    let stub = factory.state.clone();
    let session = Session::new(
        config,
        Box::new(RecordingTransport::new(recorder.clone())),
        Arc::new(factory),
        tx,
        lifecycle,
    );
    Harness {
        session,
        events,
        recorder,
        stub,
        outboxes: Vec::new(),
    }
}

/// Applies every event the timers have queued so far.
pub fn pump(session: &mut Session, events: &mut mpsc::Receiver<HubEvent>) {
    while let Ok(event) = events.try_recv() {
        session.handle(event);
    }
}
