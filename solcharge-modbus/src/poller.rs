//! Per-inverter polling engine.
//!
//! One task per configured inverter: a 30-second ticker with missed-tick
//! skip (a slow device can swallow a tick but never overlap one), every read
//! bounded by a timeout so a hung link cannot stall the task. Failures stay
//! local to the inverter; the task keeps retrying and other pollers never
//! notice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use solcharge_core::{AuditEvent, CoreError, InverterId, InverterStatus, Store};

use crate::link::{InverterEndpoint, InverterLink, LinkConnector};
use crate::registers::{decode_block, writable_register, INPUT_BLOCK_LEN, INPUT_BLOCK_START};

/// Poller timing knobs
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Control operations delivered to the running poller task
enum PollerCommand {
    Restart {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    SetParameter {
        name: String,
        value: f64,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

/// Handle for controlling a running poller
#[derive(Clone)]
pub struct PollerHandle {
    pub inverter: InverterId,
    tx: mpsc::Sender<PollerCommand>,
}

impl PollerHandle {
    /// Close and reopen the device connection
    pub async fn restart(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PollerCommand::Restart { reply })
            .await
            .map_err(|_| CoreError::DeviceIo(format!("poller {} gone", self.inverter)))?;
        rx.await
            .map_err(|_| CoreError::DeviceIo(format!("poller {} gone", self.inverter)))?
    }

    /// Write a named parameter, if the register map exposes it writable
    pub async fn set_parameter(&self, name: &str, value: f64) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PollerCommand::SetParameter {
                name: name.to_string(),
                value,
                reply,
            })
            .await
            .map_err(|_| CoreError::DeviceIo(format!("poller {} gone", self.inverter)))?;
        rx.await
            .map_err(|_| CoreError::DeviceIo(format!("poller {} gone", self.inverter)))?
    }
}

/// Polling engine for one inverter
pub struct InverterPoller {
    code: InverterId,
    endpoint: InverterEndpoint,
    store: Arc<dyn Store>,
    connector: Arc<dyn LinkConnector>,
    config: PollerConfig,
    link: Option<Box<dyn InverterLink>>,
}

impl InverterPoller {
    pub fn new(
        code: InverterId,
        endpoint: InverterEndpoint,
        store: Arc<dyn Store>,
        connector: Arc<dyn LinkConnector>,
        config: PollerConfig,
    ) -> Self {
        Self {
            code,
            endpoint,
            store,
            connector,
            config,
            link: None,
        }
    }

    /// Spawn the poller task, returning its control handle
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (PollerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = PollerHandle {
            inverter: self.code.clone(),
            tx,
        };
        let task = tokio::spawn(self.run(rx, shutdown));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<PollerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(inverter = %self.code, endpoint = %self.endpoint, "poller started");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_cycle().await,

                command = commands.recv() => match command {
                    Some(PollerCommand::Restart { reply }) => {
                        let _ = reply.send(self.restart().await);
                    }
                    Some(PollerCommand::SetParameter { name, value, reply }) => {
                        let _ = reply.send(self.set_parameter(&name, value).await);
                    }
                    None => break,
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Dropping the link closes the socket
        self.link = None;
        info!(inverter = %self.code, "poller stopped");
    }

    async fn poll_cycle(&mut self) {
        if self.link.is_none() {
            if let Err(e) = self.open_link().await {
                warn!(inverter = %self.code, error = %e, "connect failed, retrying next cycle");
                if let Err(e) = self
                    .store
                    .set_inverter_status(&self.code, InverterStatus::Offline)
                {
                    warn!(inverter = %self.code, error = %e, "status update failed");
                }
                return;
            }
        }

        match self.read_block().await {
            Ok(block) => {
                let snapshot = decode_block(&block);
                debug!(
                    inverter = %self.code,
                    power = ?snapshot.power_kw,
                    "poll ok"
                );
                if let Err(e) = self.store.record_poll(&self.code, snapshot, Utc::now()) {
                    warn!(inverter = %self.code, error = %e, "telemetry write failed");
                }
            }
            Err(e) => {
                warn!(inverter = %self.code, error = %e, "read failed");
                if let Err(e) = self
                    .store
                    .set_inverter_status(&self.code, InverterStatus::Error)
                {
                    warn!(inverter = %self.code, error = %e, "status update failed");
                }
                // Drop the broken link and try one reconnect before the next
                // cycle picks up the retry cadence.
                self.link = None;
                if let Err(e) = self.open_link().await {
                    debug!(inverter = %self.code, error = %e, "reconnect failed");
                }
            }
        }
    }

    async fn open_link(&mut self) -> Result<(), CoreError> {
        let link = self.connector.connect(&self.endpoint).await?;
        info!(inverter = %self.code, endpoint = %self.endpoint, "link open");
        self.link = Some(link);
        Ok(())
    }

    async fn read_block(&mut self) -> Result<Vec<u16>, CoreError> {
        let timeout = self.config.read_timeout;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| CoreError::DeviceIo("no open link".to_string()))?;
        match tokio::time::timeout(
            timeout,
            link.read_input_registers(INPUT_BLOCK_START, INPUT_BLOCK_LEN),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeviceIo(format!(
                "read timed out after {:?}",
                timeout
            ))),
        }
    }

    async fn restart(&mut self) -> Result<(), CoreError> {
        info!(inverter = %self.code, "restart requested");
        self.link = None;
        let outcome = self.open_link().await;
        self.store.record_event(AuditEvent::info(
            "inverter",
            "connection restarted",
            serde_json::json!({
                "inverter": self.code,
                "ok": outcome.is_ok(),
            }),
        ));
        outcome
    }

    async fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), CoreError> {
        let def = writable_register(name)
            .ok_or_else(|| CoreError::ParameterNotSupported(name.to_string()))?;

        let raw = value * def.scale;
        if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
            return Err(CoreError::ParameterNotSupported(format!(
                "{} value {} out of range",
                name, value
            )));
        }

        if self.link.is_none() {
            self.open_link().await?;
        }
        let timeout = self.config.read_timeout;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| CoreError::DeviceIo("no open link".to_string()))?;

        match tokio::time::timeout(
            timeout,
            link.write_single_register(def.address, raw.round() as u16),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CoreError::DeviceIo(format!(
                    "write timed out after {:?}",
                    timeout
                )))
            }
        }

        self.store.record_event(AuditEvent::info(
            "inverter",
            "parameter written",
            serde_json::json!({
                "inverter": self.code,
                "parameter": name,
                "value": value,
                "register": def.address,
            }),
        ));
        info!(inverter = %self.code, parameter = name, value, "parameter written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use solcharge_core::{Inverter, MemoryStore, TelemetrySnapshot};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Link whose reads follow a script; writes are recorded
    struct ScriptedLink {
        reads: Arc<Mutex<VecDeque<Result<Vec<u16>, CoreError>>>>,
        writes: Arc<Mutex<Vec<(u16, u16)>>>,
    }

    #[async_trait]
    impl InverterLink for ScriptedLink {
        async fn read_input_registers(
            &mut self,
            _address: u16,
            quantity: u16,
        ) -> Result<Vec<u16>, CoreError> {
            match self.reads.lock().pop_front() {
                Some(outcome) => outcome,
                None => Ok(vec![0u16; quantity as usize]),
            }
        }

        async fn write_single_register(
            &mut self,
            address: u16,
            value: u16,
        ) -> Result<(), CoreError> {
            self.writes.lock().push((address, value));
            Ok(())
        }
    }

    /// Connector handing out scripted links, counting connect attempts
    struct ScriptedConnector {
        reads: Arc<Mutex<VecDeque<Result<Vec<u16>, CoreError>>>>,
        writes: Arc<Mutex<Vec<(u16, u16)>>>,
        connects: AtomicUsize,
        refuse: bool,
    }

    impl ScriptedConnector {
        fn new(reads: Vec<Result<Vec<u16>, CoreError>>) -> Arc<Self> {
            Arc::new(Self {
                reads: Arc::new(Mutex::new(reads.into())),
                writes: Arc::new(Mutex::new(Vec::new())),
                connects: AtomicUsize::new(0),
                refuse: false,
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                reads: Arc::new(Mutex::new(VecDeque::new())),
                writes: Arc::new(Mutex::new(Vec::new())),
                connects: AtomicUsize::new(0),
                refuse: true,
            })
        }
    }

    #[async_trait]
    impl LinkConnector for ScriptedConnector {
        async fn connect(
            &self,
            _endpoint: &InverterEndpoint,
        ) -> Result<Box<dyn InverterLink>, CoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(CoreError::DeviceIo("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedLink {
                reads: self.reads.clone(),
                writes: self.writes.clone(),
            }))
        }
    }

    fn seeded_store(code: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_inverter(Inverter {
            code: code.to_string(),
            model: "SUN2000-10KTL".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1502,
            unit_id: 1,
            rated_power_kw: 10.0,
            status: InverterStatus::Offline,
            snapshot: TelemetrySnapshot::default(),
            last_update: None,
        });
        store
    }

    fn poller(
        code: &str,
        store: Arc<MemoryStore>,
        connector: Arc<ScriptedConnector>,
    ) -> InverterPoller {
        InverterPoller::new(
            code.to_string(),
            InverterEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1502,
                unit_id: 1,
            },
            store,
            connector,
            PollerConfig {
                poll_interval: Duration::from_millis(10),
                read_timeout: Duration::from_millis(100),
            },
        )
    }

    fn good_block() -> Vec<u16> {
        let mut block = vec![0u16; INPUT_BLOCK_LEN as usize];
        block[(32080 - INPUT_BLOCK_START) as usize] = 5000; // 5 kW
        block
    }

    #[tokio::test]
    async fn successful_poll_records_sample_and_goes_online() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::new(vec![Ok(good_block())]);
        let mut poller = poller("INV01", store.clone(), connector);

        poller.poll_cycle().await;

        let inverter = store.inverter("INV01").unwrap();
        assert_eq!(inverter.status, InverterStatus::Online);
        assert_eq!(inverter.snapshot.power_kw, Some(5.0));
        assert!(inverter.last_update.is_some());
        assert_eq!(store.samples_for_inverter("INV01").len(), 1);
    }

    #[tokio::test]
    async fn initial_connect_failure_marks_offline() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::refusing();
        let mut poller = poller("INV01", store.clone(), connector.clone());

        poller.poll_cycle().await;
        assert_eq!(
            store.inverter("INV01").unwrap().status,
            InverterStatus::Offline
        );

        // The next cycle retries instead of giving up
        poller.poll_cycle().await;
        assert!(connector.connects.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn read_errors_mark_error_and_reconnect_each_cycle() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::new(vec![
            Ok(good_block()),
            Err(CoreError::DeviceIo("crc".to_string())),
            Err(CoreError::DeviceIo("crc".to_string())),
            Err(CoreError::DeviceIo("crc".to_string())),
        ]);
        let mut poller = poller("INV01", store.clone(), connector.clone());

        poller.poll_cycle().await;
        assert_eq!(
            store.inverter("INV01").unwrap().status,
            InverterStatus::Online
        );
        let connects_before = connector.connects.load(Ordering::SeqCst);

        for _ in 0..3 {
            poller.poll_cycle().await;
            assert_eq!(
                store.inverter("INV01").unwrap().status,
                InverterStatus::Error
            );
        }
        // One reconnect attempt per failed cycle
        assert_eq!(
            connector.connects.load(Ordering::SeqCst),
            connects_before + 3
        );
        // No samples appended for failed reads
        assert_eq!(store.samples_for_inverter("INV01").len(), 1);
    }

    #[tokio::test]
    async fn failing_inverter_does_not_disturb_sibling() {
        let store = seeded_store("INV01");
        store.put_inverter(Inverter {
            code: "INV02".to_string(),
            model: "SUN2000-10KTL".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1503,
            unit_id: 1,
            rated_power_kw: 10.0,
            status: InverterStatus::Offline,
            snapshot: TelemetrySnapshot::default(),
            last_update: None,
        });

        let bad = ScriptedConnector::new(vec![
            Err(CoreError::DeviceIo("down".to_string())),
            Err(CoreError::DeviceIo("down".to_string())),
            Err(CoreError::DeviceIo("down".to_string())),
        ]);
        let good = ScriptedConnector::new((0..3).map(|_| Ok(good_block())).collect());

        let mut failing = poller("INV01", store.clone(), bad);
        let mut healthy = poller("INV02", store.clone(), good);

        for _ in 0..3 {
            failing.poll_cycle().await;
            healthy.poll_cycle().await;
        }

        assert_eq!(
            store.inverter("INV01").unwrap().status,
            InverterStatus::Error
        );
        assert_eq!(
            store.inverter("INV02").unwrap().status,
            InverterStatus::Online
        );
        assert_eq!(store.samples_for_inverter("INV02").len(), 3);
    }

    #[tokio::test]
    async fn slow_read_is_bounded_by_timeout() {
        struct SlowLink;

        #[async_trait]
        impl InverterLink for SlowLink {
            async fn read_input_registers(
                &mut self,
                _address: u16,
                _quantity: u16,
            ) -> Result<Vec<u16>, CoreError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }

            async fn write_single_register(
                &mut self,
                _address: u16,
                _value: u16,
            ) -> Result<(), CoreError> {
                Ok(())
            }
        }

        struct SlowConnector;

        #[async_trait]
        impl LinkConnector for SlowConnector {
            async fn connect(
                &self,
                _endpoint: &InverterEndpoint,
            ) -> Result<Box<dyn InverterLink>, CoreError> {
                Ok(Box::new(SlowLink))
            }
        }

        let store = seeded_store("INV01");
        let mut poller = InverterPoller::new(
            "INV01".to_string(),
            InverterEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1502,
                unit_id: 1,
            },
            store.clone(),
            Arc::new(SlowConnector),
            PollerConfig {
                poll_interval: Duration::from_millis(10),
                read_timeout: Duration::from_millis(50),
            },
        );

        tokio::time::timeout(Duration::from_secs(2), poller.poll_cycle())
            .await
            .expect("cycle must be bounded by the read timeout");
        assert_eq!(
            store.inverter("INV01").unwrap().status,
            InverterStatus::Error
        );
    }

    #[tokio::test]
    async fn set_parameter_writes_scaled_register() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::new(Vec::new());
        let mut poller = poller("INV01", store.clone(), connector.clone());

        poller.set_parameter("power_limit_pct", 50.0).await.unwrap();
        assert_eq!(connector.writes.lock().as_slice(), &[(40125, 500)]);
    }

    #[tokio::test]
    async fn unknown_parameter_is_rejected() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::new(Vec::new());
        let mut poller = poller("INV01", store.clone(), connector.clone());

        let err = poller
            .set_parameter("grid_frequency", 50.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ParameterNotSupported(_)));
        // No connection was even attempted
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restart_reopens_the_link() {
        let store = seeded_store("INV01");
        let connector = ScriptedConnector::new((0..2).map(|_| Ok(good_block())).collect());
        let mut poller = poller("INV01", store.clone(), connector.clone());

        poller.poll_cycle().await;
        let before = connector.connects.load(Ordering::SeqCst);
        poller.restart().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), before + 1);
    }
}
