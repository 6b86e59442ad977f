//! The top-level acquisition: one request fanned out to every trigger modality.
//!
//! An [`AcquisitionCoordinator`] owns four sub-acquisitions:
//!
//! | sub-acquisition | channels                                    | cycles                              |
//! |-----------------|---------------------------------------------|-------------------------------------|
//! | hardware        | controllers with a hardware trigger/gate    | one, started by [`run`]             |
//! | software        | controllers without or with a software TG   | one per `Active` event              |
//! | zerod           | integrating controllers                     | one per `Active`, stopped on `Passive` |
//! | tggeneration    | trigger/gate controllers                    | one, started by [`run`]             |
//!
//! Event-driven cycles are debounced: each of the software and zerod sub-acquisitions has a
//! [`BusyGate`] entered before its cycle is submitted to the worker pool and released by the
//! pool once the cycle is over. An `Active` event arriving while a gate is busy is dropped for
//! that sub-acquisition only.
//!
//! [`run`]: AcquisitionCoordinator::run

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use acqconfig_backend::{
    extract_integration_time, window_active_time, MeasurementConfig, SynchGroup,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::acquisition::TimerableAcquisition;
use crate::action::{spawn_action, AcqRequest, Action, CycleAction};
use crate::busy_gate::BusyGate;
use crate::error::AcqResult;
use crate::settings::AcqSettings;
use crate::tggeneration::{
    check_timeline, TgRequest, TriggerEvent, TriggerEventType, TriggerGeneration, TriggerListener,
};
use crate::worker_pool::{RayonWorkerPool, WorkerPool};
use crate::zerod::{ZeroDAcquisition, ZeroDRequest};

/// Timing of the cycles fired by trigger events.
#[derive(Clone)]
struct EventCycles {
    software: Option<Arc<MeasurementConfig>>,
    zerod: Option<Arc<MeasurementConfig>>,
    synchronization: Vec<SynchGroup>,
    monitor_count: Option<f64>,
}
impl EventCycles {
    /// Request of the software cycle of window `id`.
    fn software_request(&self, config: Arc<MeasurementConfig>, id: u64) -> AcqRequest {
        let request = AcqRequest::new(config).with_index(id);
        match self.monitor_count {
            Some(count) => request.with_monitor_count(count),
            None => {
                let integ_time = window_active_time(&self.synchronization, id)
                    .or_else(|| self.synchronization.first().map(|group| group.active.time))
                    .unwrap_or_default();
                request.with_integ_time(integ_time)
            }
        }
    }
}

pub struct AcquisitionCoordinator {
    name: String,
    this: Weak<AcquisitionCoordinator>,
    hardware: Arc<TimerableAcquisition>,
    software: Arc<TimerableAcquisition>,
    zerod: Arc<ZeroDAcquisition>,
    tggen: Arc<TriggerGeneration>,
    pool: Arc<dyn WorkerPool>,
    software_busy: Arc<BusyGate>,
    zerod_busy: Arc<BusyGate>,
    event_cycles: Mutex<Option<EventCycles>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}
impl AcquisitionCoordinator {
    /// A coordinator running its event-driven cycles on a pool of `settings.worker_pool_size`
    /// threads.
    pub fn new(name: &str, settings: &AcqSettings) -> AcqResult<Arc<Self>> {
        let pool = Arc::new(RayonWorkerPool::new(settings.worker_pool_size)?);
        Ok(Self::with_pool(name, settings, pool))
    }

    pub fn with_pool(name: &str, settings: &AcqSettings, pool: Arc<dyn WorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            this: this.clone(),
            hardware: Arc::new(TimerableAcquisition::hardware(
                &format!("{}.hardware", name),
                settings,
            )),
            software: Arc::new(TimerableAcquisition::software(
                &format!("{}.software", name),
                settings,
            )),
            zerod: Arc::new(ZeroDAcquisition::new(&format!("{}.zerod", name), settings)),
            tggen: Arc::new(TriggerGeneration::new(
                &format!("{}.tggeneration", name),
                settings,
            )),
            pool,
            software_busy: Arc::new(BusyGate::new()),
            zerod_busy: Arc::new(BusyGate::new()),
            event_cycles: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware(&self) -> &Arc<TimerableAcquisition> {
        &self.hardware
    }

    pub fn software(&self) -> &Arc<TimerableAcquisition> {
        &self.software
    }

    pub fn zerod(&self) -> &Arc<ZeroDAcquisition> {
        &self.zerod
    }

    pub fn tggen(&self) -> &Arc<TriggerGeneration> {
        &self.tggen
    }

    pub fn is_software_busy(&self) -> bool {
        self.software_busy.is_busy()
    }

    pub fn is_zerod_busy(&self) -> bool {
        self.zerod_busy.is_busy()
    }

    /// Starts an acquisition of `config` following `synchronization`.
    ///
    /// The hardware-triggered controllers are started right away with the integration
    /// time(s) of the synchronization, or with `monitor_count` when given. The software and
    /// integrating controllers are cycled on the events of the trigger generation, started
    /// last.
    ///
    /// # Errors
    /// Configuration and protocol errors of the hardware and trigger generation starts. The
    /// sub-acquisitions started before the failure keep running.
    pub fn run(
        &self,
        config: &MeasurementConfig,
        synchronization: &[SynchGroup],
        monitor_count: Option<f64>,
        repetitions: Option<u64>,
    ) -> AcqResult<()> {
        let integ_time = extract_integration_time(synchronization)?;
        check_timeline(synchronization)?;
        let (hardware, software, zerod) = config.split_by_trigger_modality();
        let (tg_config, _) = config.trigger_gate_config();
        info!(
            acquisition = %self.name,
            hardware = hardware.controllers.len(),
            software = software.controllers.len(),
            zerod = zerod.controllers.len(),
            "starting acquisition"
        );

        if !hardware.is_empty() {
            let mut request = AcqRequest::new(Arc::new(hardware));
            request = match monitor_count {
                Some(count) => request.with_monitor_count(count),
                None => request.with_integ_time(integ_time),
            };
            if let Some(repetitions) = repetitions {
                request = request.with_repetitions(repetitions);
            }
            let handle = spawn_action(self.hardware.clone(), &request)?;
            self.handles.lock().push(handle);
        }

        let event_driven = !software.is_empty() || !zerod.is_empty();
        let listener: Weak<dyn TriggerListener> = self.this.clone();
        if event_driven {
            self.tggen.add_listener(listener);
            *self.event_cycles.lock() = Some(EventCycles {
                software: (!software.is_empty()).then(|| Arc::new(software)),
                zerod: (!zerod.is_empty()).then(|| Arc::new(zerod)),
                synchronization: synchronization.to_vec(),
                monitor_count,
            });
        } else {
            self.tggen.remove_listener(&listener);
            *self.event_cycles.lock() = None;
        }

        let request = TgRequest {
            software_events: event_driven || tg_config.has_software_elements(),
            config: tg_config,
            synchronization: synchronization.to_vec(),
        };
        let handle = spawn_action(self.tggen.clone(), &request)?;
        self.handles.lock().push(handle);
        Ok(())
    }

    fn dispatch_software(&self, cycles: &EventCycles, config: Arc<MeasurementConfig>, id: u64) {
        if !self.software_busy.try_enter() {
            debug!(acquisition = %self.name, id, "skipping trigger: software acquisition is still in progress");
            return;
        }
        debug!(acquisition = %self.name, id, "executing software acquisition");
        let acquisition = self.software.clone();
        let name = acquisition.name().to_string();
        let request = cycles.software_request(config, id);
        let gate = self.software_busy.clone();
        self.pool.submit(
            &name,
            Box::new(move || acquisition.run(&request)),
            Box::new(move |busy| gate.set(busy)),
        );
    }

    fn dispatch_zerod(&self, config: Arc<MeasurementConfig>, id: u64) {
        if !self.zerod_busy.try_enter() {
            debug!(acquisition = %self.name, id, "skipping trigger: zerod acquisition is still in progress");
            return;
        }
        debug!(acquisition = %self.name, id, "executing zerod acquisition");
        // from here on a Passive event stops the queued cycle
        self.zerod.prepare();
        let acquisition = self.zerod.clone();
        let name = acquisition.name().to_string();
        let request = ZeroDRequest::new(config).with_index(id);
        let gate = self.zerod_busy.clone();
        self.pool.submit(
            &name,
            Box::new(move || acquisition.run(&request)),
            Box::new(move |busy| gate.set(busy)),
        );
    }

    fn sub_acquisitions(&self) -> [&dyn Action; 4] {
        [
            self.hardware.as_ref(),
            self.software.as_ref(),
            self.zerod.as_ref(),
            self.tggen.as_ref(),
        ]
    }

    /// Whether any sub-acquisition is running.
    pub fn is_running(&self) -> bool {
        self.sub_acquisitions().iter().any(|action| action.is_running())
    }

    /// Stops every sub-acquisition. All are attempted; the first failure is returned.
    pub fn stop(&self) -> AcqResult<()> {
        self.end(false)
    }

    pub fn abort(&self) -> AcqResult<()> {
        self.end(true)
    }

    fn end(&self, abort: bool) -> AcqResult<()> {
        let mut result = Ok(());
        for action in self.sub_acquisitions() {
            let res = if abort {
                action.abort_action()
            } else {
                action.stop_action()
            };
            if let Err(err) = res {
                error!(acquisition = %self.name, action = action.name(), "{}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Controllers involved in the last cycles of every sub-acquisition.
    pub fn controllers(&self) -> Vec<String> {
        let mut controllers: Vec<String> = Vec::new();
        for ctrl in self
            .hardware
            .controllers()
            .into_iter()
            .chain(self.software.controllers())
            .chain(self.zerod.controllers())
            .chain(self.tggen.controllers())
        {
            if !controllers.contains(&ctrl) {
                controllers.push(ctrl);
            }
        }
        controllers
    }

    /// Waits for the hardware acquisition and trigger generation threads started by
    /// [`run`](Self::run).
    pub fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(acquisition = %self.name, "acquisition thread panicked");
            }
        }
    }
}

impl TriggerListener for AcquisitionCoordinator {
    /// Dispatches the event-driven cycles.
    ///
    /// Events are expected from a single trigger source at a time.
    fn event_received(&self, source: &str, event: TriggerEvent) {
        debug!(acquisition = %self.name, source, ?event, "event received");
        let Some(cycles) = self.event_cycles.lock().clone() else {
            return;
        };
        match event.event_type {
            TriggerEventType::Active => {
                if let Some(config) = cycles.software.clone() {
                    self.dispatch_software(&cycles, config, event.id);
                }
                if let Some(config) = cycles.zerod.clone() {
                    self.dispatch_zerod(config, event.id);
                }
            }
            TriggerEventType::Passive => {
                if cycles.zerod.is_some() && self.zerod_busy.is_busy() {
                    debug!(acquisition = %self.name, id = event.id, "stopping zerod acquisition");
                    if let Err(err) = self.zerod.stop_action() {
                        warn!(acquisition = %self.name, "unable to stop zerod acquisition: {}", err);
                    }
                }
            }
        }
    }
}
