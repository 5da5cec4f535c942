//! Common test utilities for rshogi-session integration tests

#![allow(dead_code)] // These utilities may be used by various test files

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::Mutex;

use rshogi_session::clock::ManualTimeSource;
use rshogi_session::engine::{CancelToken, EngineClient, EngineFactory, EngineOutcome, SearchRequest};
use rshogi_session::position::{LegalQueryOptions, Position, PositionService, ReplayResult};
use rshogi_session::types::{Color, EvalEvent, PassRights};
use rshogi_session::{MatchSession, SessionConfig, SessionEvent};

pub const T_ENGINE: Duration = Duration::from_secs(3);

/// 盤面を持たない局面サービスで常に合法な指し手
pub const DEFAULT_MOVES: &[&str] = &[
    "7g7f", "3c3d", "2g2f", "8c8d", "2f2e", "8d8e", "6i7h", "4a3b", "5g5f", "5c5d",
];

/// 平手の SFEN 盤面部分（手番と手数だけを読む）
const BOARD: &str = "lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 盤面を持たない局面サービス
///
/// 合法手は `DEFAULT_MOVES`（手数ごとに差し替え可）と、パス権が残っていれば `pass`。
/// 局面は手番・手数・残りパス権だけを持つ。
#[derive(Default)]
pub struct FakePositionService {
    scripted: Mutex<HashMap<u32, Vec<String>>>,
    /// 王手などでパスできない手数
    no_pass: Mutex<HashSet<u32>>,
    pub legal_calls: AtomicUsize,
    pub fail_board_to_sfen: AtomicBool,
}

impl FakePositionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `ply` 手目の局面の合法手を差し替える
    pub fn script_ply(&self, ply: u32, moves: &[&str]) {
        self.scripted
            .lock()
            .insert(ply, moves.iter().map(|m| m.to_string()).collect());
    }

    /// `ply` 手目の局面ではパス権があってもパスを合法手に含めない
    pub fn forbid_pass_at(&self, ply: u32) {
        self.no_pass.lock().insert(ply);
    }

    pub fn legal_call_count(&self) -> usize {
        self.legal_calls.load(Ordering::SeqCst)
    }

    fn start_turn(&self, start: &str) -> Result<Color, String> {
        if start == "startpos" {
            Ok(Color::Black)
        } else {
            self.parse_sfen(start).map(|p| p.turn)
        }
    }

    fn remaining(initial: Option<PassRights>, start: Color, moves: &[String]) -> Option<PassRights> {
        let mut rights = initial?;
        for (i, mv) in moves.iter().enumerate() {
            if mv == "pass" {
                rights = rights.consumed(Color::after_plies(start, i as u32));
            }
        }
        Some(rights)
    }

    fn legal_at(&self, start: Color, moves: &[String], options: LegalQueryOptions) -> HashSet<String> {
        let ply = moves.len() as u32;
        let mut set: HashSet<String> = match self.scripted.lock().get(&ply) {
            Some(scripted) => scripted.iter().cloned().collect(),
            None => DEFAULT_MOVES.iter().map(|m| m.to_string()).collect(),
        };
        let side = Color::after_plies(start, ply);
        if let Some(rights) = Self::remaining(options.pass_rights, start, moves) {
            if rights.get(side) > 0 && !self.no_pass.lock().contains(&ply) {
                set.insert("pass".to_string());
            }
        }
        set
    }

    fn position_after(start: Color, moves: &[String], options: LegalQueryOptions) -> Position {
        let ply = moves.len() as u32;
        let mut position = Position::empty(Color::after_plies(start, ply), ply);
        position.pass_rights = Self::remaining(options.pass_rights, start, moves);
        position
    }
}

impl PositionService for FakePositionService {
    fn initial_board(&self) -> Result<Position, String> {
        Ok(Position::empty(Color::Black, 0))
    }

    fn parse_sfen(&self, sfen: &str) -> Result<Position, String> {
        let mut tokens = sfen.split_whitespace();
        let _board = tokens.next().ok_or("empty sfen")?;
        let turn = match tokens.next() {
            Some("b") => Color::Black,
            Some("w") => Color::White,
            other => return Err(format!("invalid side to move: {other:?}")),
        };
        Ok(Position::empty(turn, 0))
    }

    fn board_to_sfen(&self, position: &Position) -> Result<String, String> {
        if self.fail_board_to_sfen.load(Ordering::SeqCst) {
            return Err("cannot convert board".into());
        }
        let turn = match position.turn {
            Color::Black => "b",
            Color::White => "w",
        };
        Ok(format!("{BOARD} {turn} - 1"))
    }

    fn legal_moves(
        &self,
        start: &str,
        moves: &[String],
        options: LegalQueryOptions,
    ) -> Result<HashSet<String>, String> {
        self.legal_calls.fetch_add(1, Ordering::SeqCst);
        let turn = self.start_turn(start)?;
        Ok(self.legal_at(turn, moves, options))
    }

    fn replay_moves_strict(
        &self,
        start: &str,
        moves: &[String],
        options: LegalQueryOptions,
    ) -> Result<ReplayResult, String> {
        let turn = self.start_turn(start)?;
        let mut applied = Vec::new();
        for mv in moves {
            if !self.legal_at(turn, &applied, options).contains(mv) {
                return Ok(ReplayResult {
                    position: Self::position_after(turn, &applied, options),
                    applied,
                    error: Some(format!("illegal move {mv}")),
                });
            }
            applied.push(mv.clone());
        }
        Ok(ReplayResult {
            position: Self::position_after(turn, &applied, options),
            applied,
            error: None,
        })
    }
}

/// 筋書きどおりに指すエンジン
#[derive(Clone)]
pub struct FakeEngineScript {
    /// 順に返す最善手。尽きたら `3c3d`。
    pub bestmoves: Arc<Mutex<VecDeque<String>>>,
    /// 1 回の探索にかける時間
    pub delay: Duration,
    /// 中断されたら最善手なしで返す
    pub honor_cancel: bool,
    /// この手数の局面では探索に失敗する
    pub fail_plies: HashSet<usize>,
    pub searches: Arc<AtomicUsize>,
    pub created: Arc<AtomicUsize>,
}

impl Default for FakeEngineScript {
    fn default() -> Self {
        Self {
            bestmoves: Arc::default(),
            delay: Duration::ZERO,
            honor_cancel: true,
            fail_plies: HashSet::new(),
            searches: Arc::default(),
            created: Arc::default(),
        }
    }
}

impl FakeEngineScript {
    pub fn with_moves(moves: &[&str]) -> Self {
        let script = Self::default();
        script
            .bestmoves
            .lock()
            .extend(moves.iter().map(|m| m.to_string()));
        script
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ignore_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        Arc::new(FakeEngineFactory {
            script: self.clone(),
        })
    }
}

pub struct FakeEngine {
    name: String,
    script: FakeEngineScript,
}

impl EngineClient for FakeEngine {
    fn search(
        &mut self,
        request: &SearchRequest,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(&EvalEvent),
    ) -> anyhow::Result<EngineOutcome> {
        self.script.searches.fetch_add(1, Ordering::SeqCst);
        let ply = request.moves.len();
        if self.script.fail_plies.contains(&ply) {
            bail!("{}: search failed at ply {ply}", self.name);
        }
        let start = Instant::now();
        while start.elapsed() < self.script.delay {
            if self.script.honor_cancel && cancel.is_cancelled() {
                return Ok(EngineOutcome {
                    bestmove: None,
                    last_eval: None,
                    cancelled: true,
                });
            }
            thread::sleep(Duration::from_millis(2));
        }
        let bestmove = self
            .script
            .bestmoves
            .lock()
            .pop_front()
            .unwrap_or_else(|| "3c3d".to_string());
        let event = EvalEvent::cp(10 * ply as i32, 12).with_pv([bestmove.clone()]);
        on_event(&event);
        Ok(EngineOutcome {
            bestmove: Some(bestmove),
            last_eval: Some(event),
            cancelled: cancel.is_cancelled(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct FakeEngineFactory {
    script: FakeEngineScript,
}

impl EngineFactory for FakeEngineFactory {
    fn create(&self, worker_index: usize) -> anyhow::Result<Box<dyn EngineClient>> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            name: format!("fake-{worker_index}"),
            script: self.script.clone(),
        }))
    }
}

/// 手動時計つきのセッション
pub fn session_with(
    config: SessionConfig,
) -> (MatchSession, Arc<FakePositionService>, Arc<ManualTimeSource>) {
    init_logger();
    let service = FakePositionService::new();
    let time = Arc::new(ManualTimeSource::new(0));
    let session = MatchSession::new(config, service.clone(), time.clone())
        .expect("startpos always resolves");
    (session, service, time)
}

pub fn count_events(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
