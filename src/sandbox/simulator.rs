use crate::core::error::EngineError;
use crate::sandbox::client::{ExecResult, SandboxClient, SandboxHandle, ToolEndpoint};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// In-process sandbox used in offline mode and by the engine tests.
///
/// It understands the trial-runner protocol: when executed code carries a
/// `SEEDS = [...]` marker line, it emits one JSONL record per seed with a
/// metric derived deterministically from (code, seed). Tests can override any
/// exec by pushing scripted results, and can inject acquire failures to
/// exercise the scheduler's backoff path.
pub struct SimSandboxClient {
    state: Arc<SimState>,
}

struct SimState {
    scripted_execs: Mutex<VecDeque<ExecResult>>,
    fail_acquires: AtomicU32,
    live: AtomicUsize,
    max_live: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    next_id: AtomicUsize,
}

impl SimSandboxClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState {
                scripted_execs: Mutex::new(VecDeque::new()),
                fail_acquires: AtomicU32::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a scripted result; consumed in order before the default protocol.
    pub async fn push_exec(&self, result: ExecResult) {
        self.state.scripted_execs.lock().await.push_back(result);
    }

    /// The next `n` acquire calls fail with SandboxUnavailable.
    pub fn fail_next_acquires(&self, n: u32) {
        self.state.fail_acquires.store(n, Ordering::SeqCst);
    }

    pub fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    pub fn acquired_count(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }
}

impl Default for SimSandboxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxClient for SimSandboxClient {
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, EngineError> {
        let remaining = self.state.fail_acquires.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_acquires.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::SandboxUnavailable(
                "simulated provider outage".to_string(),
            ));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        metrics::gauge!("polysim_sandboxes_live").increment(1.0);

        info!(sandbox_id = id, "simulated sandbox acquired");
        Ok(Arc::new(SimSandbox {
            id: format!("sim-{id}"),
            state: self.state.clone(),
            files: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        }))
    }
}

pub struct SimSandbox {
    id: String,
    state: Arc<SimState>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    released: AtomicBool,
}

#[async_trait]
impl SandboxHandle for SimSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, code: &str, _timeout: Duration) -> Result<ExecResult, EngineError> {
        if let Some(scripted) = self.state.scripted_execs.lock().await.pop_front() {
            return Ok(scripted);
        }
        Ok(run_protocol(code))
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError> {
        self.files.lock().await.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("no such file: {path}")))
    }

    fn tool_endpoint(&self) -> ToolEndpoint {
        ToolEndpoint {
            url: format!("http://sim-gateway.invalid/{}", self.id),
            token: "sim-token".to_string(),
        }
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.released.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("polysim_sandboxes_live").decrement(1.0);
        info!(sandbox_id = %self.id, "simulated sandbox released");
    }
}

/// Default behavior: honor the trial-runner protocol deterministically.
fn run_protocol(code: &str) -> ExecResult {
    let seeds = match extract_seeds(code) {
        Some(s) => s,
        None => {
            return ExecResult {
                exit_code: 0,
                ..Default::default()
            };
        }
    };

    let salt = code.len() as u64;
    let mut stdout = String::new();
    for seed in seeds {
        let metric = sim_metric(salt, seed);
        stdout.push_str(&format!("{{\"seed\": {seed}, \"metric\": {metric}}}\n"));
    }
    ExecResult {
        exit_code: 0,
        stdout,
        stderr: String::new(),
        timed_out: false,
    }
}

fn extract_seeds(code: &str) -> Option<Vec<u64>> {
    let line = code.lines().find(|l| l.starts_with("SEEDS = "))?;
    serde_json::from_str(line.trim_start_matches("SEEDS = ").trim()).ok()
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministic metric in [0, 1) for (artifact, seed).
fn sim_metric(salt: u64, seed: u64) -> f64 {
    (splitmix64(seed.wrapping_mul(0x0101_0101_0101_0101) ^ salt) >> 11) as f64
        / (1u64 << 53) as f64
}
