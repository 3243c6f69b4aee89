use std::{collections::HashMap, time::Duration};
use tracing::{error, info, warn};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};

type ActorFactory = Box<dyn Fn() -> Box<dyn Actor> + Send + Sync>;

pub struct Supervisor {
    actor_factories: HashMap<ActorType, ActorFactory>,
    instances: HashMap<ActorType, Uuid>,
    pulses: HashMap<ActorType, Instant>,
    handles: HashMap<ActorType, JoinHandle<()>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            actor_factories: HashMap::new(),
            instances: HashMap::new(),
            pulses: HashMap::new(),
            handles: HashMap::new(),
            shutdown_rx,
        }
    }

    pub fn register_actor(&mut self, actor_type: ActorType, factory: ActorFactory) {
        self.actor_factories.insert(actor_type, factory);
    }

    /// Runs the actors, restarting any that stop sending heartbeats or whose
    /// task ends without a shutdown message, until shutdown is signalled.
    pub async fn start(&mut self) {
        let mut check_interval = time::interval(Duration::from_secs(1));
        let timeout_duration = Duration::from_secs(3);

        let (supervisor_tx, mut supervisor_rx) = mpsc::channel::<ControlMessage>(512);

        let actors: Vec<ActorType> = self.actor_factories.keys().copied().collect();
        actors.into_iter().for_each(|actor| {
            self.spawn_actor(actor, supervisor_tx.clone());
        });

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(msg) = supervisor_rx.recv() => {
                    match msg {
                        ControlMessage::Heartbeat(id) => {
                            if let Some(actor_type) = self.actor_of(id) {
                                self.pulses.insert(actor_type, Instant::now());
                            }
                        }
                        ControlMessage::Shutdown(id) => {
                            if let Some(actor_type) = self.actor_of(id) {
                                warn!("{:?} is shutting down gracefully.", actor_type);
                                self.pulses.remove(&actor_type);
                                self.instances.remove(&actor_type);
                                if let Some(handle) = self.handles.remove(&actor_type) {
                                    handle.abort();
                                }
                            }
                        },
                        ControlMessage::Error(id, error_msg) => {
                            if let Some(actor_type) = self.actor_of(id) {
                                error!("Actor {:?} reported error: {}", actor_type, error_msg);
                                self.pulses.insert(actor_type, Instant::now());
                            }
                        },
                    }
                }

                _ = check_interval.tick() => {
                    let dead_timeout = Instant::now() - timeout_duration;

                    let mut dead_actors: Vec<ActorType> = self
                        .pulses
                        .iter()
                        .filter(|(_, last)| **last < dead_timeout)
                        .map(|(actor_type, _)| *actor_type)
                        .collect();
                    // Returned or panicked without announcing a shutdown.
                    let crashed: Vec<ActorType> = self
                        .handles
                        .iter()
                        .filter(|(actor_type, handle)| {
                            handle.is_finished() && !dead_actors.contains(actor_type)
                        })
                        .map(|(actor_type, _)| *actor_type)
                        .collect();
                    dead_actors.extend(crashed);

                    for actor_type in dead_actors {
                        warn!("{:?} is unresponsive! Restarting.", actor_type);
                        if let Some(handle) = self.handles.remove(&actor_type) {
                            handle.abort();
                        }
                        self.spawn_actor(actor_type, supervisor_tx.clone());
                    }
                }
            }
        }

        info!("Supervisor stopping {} actors", self.handles.len());
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
        self.pulses.clear();
        self.instances.clear();
    }

    /// Messages from a replaced instance are ignored.
    fn actor_of(&self, id: Uuid) -> Option<ActorType> {
        self.instances
            .iter()
            .find(|(_, instance)| **instance == id)
            .map(|(actor_type, _)| *actor_type)
    }

    fn spawn_actor(&mut self, actor_type: ActorType, tx: mpsc::Sender<ControlMessage>) {
        let Some(factory) = self.actor_factories.get(&actor_type) else {
            return;
        };
        let mut new_actor = factory();
        self.instances.insert(actor_type, new_actor.id());

        let new_actor_handle = tokio::spawn(async move {
            if let Err(e) = new_actor.run(tx).await {
                error!("Actor {:?} crashed: {}", &actor_type, e);
            }
        });
        self.handles.insert(actor_type, new_actor_handle);
        self.pulses.insert(actor_type, Instant::now());
    }
}
