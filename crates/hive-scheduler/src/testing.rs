//! In-process fakes for scheduler tests: scripted worker processes and a
//! scripted resource probe. Clones share state, so a test keeps one
//! handle while the task manager owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use hive_core::{DeviceRef, Pid};
use hive_probe::{LoadAverage, ProbeError, ProbeResult, ResourceProbe, ResourceSnapshot};

use crate::error::{SchedulerError, SchedulerResult};
use crate::launcher::{WorkerExit, WorkerLauncher, WorkerProcess, WorkerSpec};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a fake process does on SIGTERM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTerm {
    Exit,
    Ignore,
}

/// Everything the fake launcher and its processes saw.
#[derive(Debug, Default)]
pub struct Record {
    pub launched: Vec<WorkerSpec>,
    pub terminated: Vec<Pid>,
    pub killed: Vec<Pid>,
    pub crashed: Vec<Pid>,
}

pub struct FakeProcess {
    pid: Pid,
    on_term: OnTerm,
    exited: Option<WorkerExit>,
    record: Arc<Mutex<Record>>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn try_exit(&mut self) -> SchedulerResult<Option<WorkerExit>> {
        if self.exited.is_none() && lock(&self.record).crashed.contains(&self.pid) {
            self.exited = Some(WorkerExit { code: Some(1) });
        }
        Ok(self.exited)
    }

    fn terminate(&mut self) -> SchedulerResult<()> {
        lock(&self.record).terminated.push(self.pid);
        if self.on_term == OnTerm::Exit {
            self.exited = Some(WorkerExit { code: Some(0) });
        }
        Ok(())
    }

    async fn kill(&mut self) -> SchedulerResult<WorkerExit> {
        lock(&self.record).killed.push(self.pid);
        let exit = WorkerExit { code: None };
        self.exited = Some(exit);
        Ok(exit)
    }

    async fn wait(&mut self) -> SchedulerResult<WorkerExit> {
        match self.exited {
            Some(exit) => Ok(exit),
            None => std::future::pending().await,
        }
    }
}

/// Hands out fake processes with pids 1001, 1002, ...
#[derive(Clone)]
pub struct FakeLauncher {
    next_pid: Arc<Mutex<Pid>>,
    on_term: Arc<Mutex<OnTerm>>,
    fail: Arc<Mutex<bool>>,
    pub record: Arc<Mutex<Record>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: Arc::new(Mutex::new(1000)),
            on_term: Arc::new(Mutex::new(OnTerm::Exit)),
            fail: Arc::new(Mutex::new(false)),
            record: Arc::new(Mutex::new(Record::default())),
        }
    }

    pub fn set_on_term(&self, on_term: OnTerm) {
        *lock(&self.on_term) = on_term;
    }

    pub fn set_fail(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    /// Make `pid` exit with status 1 at its next poll.
    pub fn crash(&self, pid: Pid) {
        lock(&self.record).crashed.push(pid);
    }

    pub fn launched(&self) -> Vec<WorkerSpec> {
        lock(&self.record).launched.clone()
    }

    pub fn terminated(&self) -> Vec<Pid> {
        lock(&self.record).terminated.clone()
    }

    pub fn killed(&self) -> Vec<Pid> {
        lock(&self.record).killed.clone()
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&mut self, spec: &WorkerSpec) -> SchedulerResult<Box<dyn WorkerProcess>> {
        if *lock(&self.fail) {
            return Err(SchedulerError::Spawn(std::io::Error::other("spawn refused")));
        }
        let pid = {
            let mut next = lock(&self.next_pid);
            *next += 1;
            *next
        };
        lock(&self.record).launched.push(spec.clone());
        Ok(Box::new(FakeProcess {
            pid,
            on_term: *lock(&self.on_term),
            exited: None,
            record: self.record.clone(),
        }))
    }
}

/// Values the scripted probe returns.
#[derive(Debug, Clone)]
pub struct ProbeScript {
    pub snapshot: ResourceSnapshot,
    /// Successive `load_average` results; the last one repeats.
    pub loads: VecDeque<LoadAverage>,
    pub process_cpu: HashMap<Pid, f32>,
    pub gpu_utilization: HashMap<DeviceRef, u32>,
    pub fail_snapshot: bool,
}

#[derive(Clone)]
pub struct ScriptedProbe {
    script: Arc<Mutex<ProbeScript>>,
}

impl ScriptedProbe {
    /// `cores` idle cores, load 0, no GPU monitoring.
    pub fn idle(cores: usize) -> Self {
        Self::new(ResourceSnapshot {
            load: LoadAverage::default(),
            available_cores: cores,
            core_usage: vec![0.0; cores],
            gpu_monitoring: false,
            gpus: Vec::new(),
        })
    }

    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            script: Arc::new(Mutex::new(ProbeScript {
                snapshot,
                loads: VecDeque::new(),
                process_cpu: HashMap::new(),
                gpu_utilization: HashMap::new(),
                fail_snapshot: false,
            })),
        }
    }

    /// Edit the script in place.
    pub fn update(&self, f: impl FnOnce(&mut ProbeScript)) {
        f(&mut lock(&self.script));
    }
}

#[async_trait]
impl ResourceProbe for ScriptedProbe {
    async fn snapshot(&mut self) -> ProbeResult<ResourceSnapshot> {
        let script = lock(&self.script);
        if script.fail_snapshot {
            return Err(ProbeError::NoCores);
        }
        Ok(script.snapshot.clone())
    }

    fn load_average(&mut self) -> LoadAverage {
        let mut script = lock(&self.script);
        if script.loads.len() > 1 {
            script.loads.pop_front().unwrap_or_default()
        } else {
            script
                .loads
                .front()
                .copied()
                .unwrap_or(script.snapshot.load)
        }
    }

    fn available_cores(&self) -> usize {
        lock(&self.script).snapshot.available_cores
    }

    async fn process_cpu(&mut self, pids: &[Pid]) -> Vec<Option<f32>> {
        let script = lock(&self.script);
        pids.iter()
            .map(|pid| script.process_cpu.get(pid).copied())
            .collect()
    }

    fn device_utilization(&self, device: &DeviceRef) -> ProbeResult<u32> {
        let script = lock(&self.script);
        if !script.snapshot.gpu_monitoring {
            return Err(ProbeError::GpuUnavailable);
        }
        script
            .gpu_utilization
            .get(device)
            .copied()
            .ok_or_else(|| ProbeError::UnknownDevice {
                device: device.clone(),
            })
    }

    fn gpu_available(&self) -> bool {
        lock(&self.script).snapshot.gpu_monitoring
    }

    fn resident_memory(&mut self, _pid: Pid) -> Option<u64> {
        None
    }
}
