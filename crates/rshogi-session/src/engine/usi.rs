//! USI エンジンプロセス

use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::{CancelToken, EngineClient, EngineFactory, EngineOutcome, SearchRequest};
use crate::types::EvalEvent;

pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// 中断フラグを確認する間隔
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// 思考時間を超えてから stop を送るまでの猶予
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(1000);

/// エンジンプロセス起動時の設定
#[derive(Debug, Clone, Default)]
pub struct UsiEngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub threads: usize,
    pub hash_mb: u32,
    /// 追加の USI オプション（Name=Value 形式）
    pub usi_options: Vec<String>,
}

/// 1 本の USI エンジンに対する入出力
pub struct UsiEngineClient {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    opt_names: HashSet<String>,
    label: String,
    /// stop に対する bestmove をまだ受け取っていない
    owes_bestmove: bool,
}

impl UsiEngineClient {
    pub fn spawn(cfg: &UsiEngineConfig, label: String) -> Result<Self> {
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn engine at {}", cfg.path.display()))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        std::thread::Builder::new()
            .name(format!("{label}-stdout"))
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(l) => {
                            if tx.send(l).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .context("failed to spawn engine reader thread")?;

        let mut client = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            opt_names: HashSet::new(),
            label,
            owes_bestmove: false,
        };
        client.initialize(cfg)?;
        Ok(client)
    }

    fn initialize(&mut self, cfg: &UsiEngineConfig) -> Result<()> {
        self.write_line("usi")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line == "usiok" {
                break;
            }
        }
        if cfg.threads > 0 {
            self.set_option_if_available("Threads", &cfg.threads.to_string())?;
        }
        if cfg.hash_mb > 0 {
            let hash = cfg.hash_mb.to_string();
            self.set_option_if_available("USI_Hash", &hash)?;
            self.set_option_if_available("Hash", &hash)?;
        }
        for opt in &cfg.usi_options {
            if let Some((name, value)) = opt.split_once('=') {
                self.set_option_if_available(name.trim(), value.trim())?;
            } else {
                self.write_line(&format!("setoption name {}", opt.trim()))?;
            }
        }
        self.sync_ready()?;
        self.write_line("usinewgame")?;
        log::debug!("{}: ready ({} options)", self.label, self.opt_names.len());
        Ok(())
    }

    pub fn sync_ready(&mut self) -> Result<()> {
        self.write_line("isready")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if line == "readyok" {
                break;
            }
        }
        Ok(())
    }

    fn recv_line(&self, timeout: Duration) -> Result<String> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| anyhow!("{}: engine read timeout", self.label))
    }

    /// 前回の探索で受け取り損ねた bestmove を読み捨てる
    fn settle_pending_bestmove(&mut self) -> Result<()> {
        if !self.owes_bestmove {
            return Ok(());
        }
        let deadline = Instant::now() + ENGINE_READY_TIMEOUT;
        loop {
            let line = self.recv_line(deadline.saturating_duration_since(Instant::now()))?;
            if line.starts_with("bestmove") {
                log::debug!("{}: discarded late {line}", self.label);
                self.owes_bestmove = false;
                return Ok(());
            }
        }
    }

    fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<()> {
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&format!("setoption name {name} value {value}"))?;
        }
        Ok(())
    }

    fn write_line(&mut self, msg: &str) -> Result<()> {
        self.stdin.write_all(msg.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl EngineClient for UsiEngineClient {
    fn search(
        &mut self,
        request: &SearchRequest,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(&EvalEvent),
    ) -> Result<EngineOutcome> {
        self.settle_pending_bestmove()?;
        self.write_line(&request.position_command())?;
        self.write_line(&request.limit.go_command())?;

        let start = Instant::now();
        let soft_limit = request
            .limit
            .think_limit_ms()
            .map(|ms| Duration::from_millis(ms) + TIMEOUT_MARGIN);
        let mut stop_deadline: Option<Instant> = None;
        let mut snapshot = EvalEvent::default();
        let mut last_eval = None;

        loop {
            let now = Instant::now();
            if let Some(deadline) = stop_deadline {
                if now >= deadline {
                    log::warn!("{}: no bestmove after stop", self.label);
                    self.owes_bestmove = true;
                    return Ok(EngineOutcome {
                        bestmove: None,
                        last_eval,
                        cancelled: cancel.is_cancelled(),
                    });
                }
            } else if cancel.is_cancelled()
                || soft_limit.is_some_and(|limit| start.elapsed() >= limit)
            {
                self.write_line("stop")?;
                stop_deadline = Some(now + TIMEOUT_MARGIN);
            }

            match self.rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(line) => {
                    if line.starts_with("info") {
                        if snapshot.update_from_line(&line) && snapshot.score.is_some() {
                            if !cancel.is_cancelled() {
                                on_event(&snapshot);
                            }
                            last_eval = Some(snapshot.clone());
                        }
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("bestmove") {
                        let mv = rest.split_whitespace().next().map(str::to_string);
                        return Ok(EngineOutcome {
                            bestmove: mv,
                            last_eval,
                            cancelled: cancel.is_cancelled(),
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("{}: engine exited unexpectedly", self.label);
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

impl Drop for UsiEngineClient {
    fn drop(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// 同じ設定でワーカーごとにプロセスを起動する
#[derive(Debug, Clone)]
pub struct UsiEngineFactory {
    config: Arc<UsiEngineConfig>,
}

impl UsiEngineFactory {
    pub fn new(config: UsiEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl EngineFactory for UsiEngineFactory {
    fn create(&self, worker_index: usize) -> Result<Box<dyn EngineClient>> {
        let client = UsiEngineClient::spawn(&self.config, format!("engine-{worker_index}"))?;
        Ok(Box::new(client))
    }
}

/// `option name <NAME> type …` から名前を取り出す（空白を含む名前に対応）
pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "name" {
            let mut parts = Vec::new();
            while let Some(next) = tokens.next_if(|t| *t != "type") {
                parts.push(next.to_string());
            }
            if !parts.is_empty() {
                return Some(parts.join(" "));
            }
        }
    }
    None
}
