//! 思考エンジンとの境界
//!
//! エンジンの探索そのものは扱わない。局面と制限を渡して評価イベントを受け取り、
//! 最善手を返す [`EngineClient`] と、それをワーカーごとに作る [`EngineFactory`] だけを定める。
//! 中断は [`CancelToken`] で行い、エンジン側が探索ループの中で確認する。

mod usi;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::clock::TimeArgs;
use crate::record::GameRecord;
use crate::types::EvalEvent;

pub use usi::{UsiEngineClient, UsiEngineConfig, UsiEngineFactory, parse_option_name};

/// 協調的な中断フラグ。複製はすべて同じフラグを共有する。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 探索の制限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchLimit {
    /// 解析: 時間（ms, 0 なら無制限）と深さ
    Analysis { time_ms: u64, depth: Option<u32> },
    /// 対局: 時計から求めた持ち時間
    Clock(TimeArgs),
}

impl SearchLimit {
    pub fn go_command(&self) -> String {
        match *self {
            SearchLimit::Analysis { time_ms, depth } => {
                let mut cmd = String::from("go");
                if let Some(depth) = depth {
                    cmd.push_str(&format!(" depth {depth}"));
                }
                if time_ms > 0 {
                    cmd.push_str(&format!(" movetime {time_ms}"));
                } else if depth.is_none() {
                    cmd.push_str(" infinite");
                }
                cmd
            }
            SearchLimit::Clock(args) => args.to_go_command(),
        }
    }

    /// エンジンが守るべき思考時間の上限（ms）。無制限なら `None`。
    pub fn think_limit_ms(&self) -> Option<u64> {
        match *self {
            SearchLimit::Analysis { time_ms: 0, .. } => None,
            SearchLimit::Analysis { time_ms, .. } => Some(time_ms),
            SearchLimit::Clock(args) => Some(args.btime.max(args.wtime) + args.byoyomi),
        }
    }
}

/// 1 回の探索依頼
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// `"startpos"` または SFEN
    pub sfen: String,
    pub moves: Vec<String>,
    pub limit: SearchLimit,
}

impl SearchRequest {
    pub fn analysis(sfen: impl Into<String>, moves: Vec<String>, time_ms: u64, depth: Option<u32>) -> Self {
        Self {
            sfen: sfen.into(),
            moves,
            limit: SearchLimit::Analysis { time_ms, depth },
        }
    }

    pub fn position_command(&self) -> String {
        GameRecord::new(self.sfen.clone(), self.moves.clone()).to_usi_position()
    }
}

/// 探索結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutcome {
    /// `None` は時間切れまたは中断で最善手が返らなかった場合
    pub bestmove: Option<String>,
    /// 最後に受け取った（スコア付きの）評価イベント
    pub last_eval: Option<EvalEvent>,
    pub cancelled: bool,
}

/// 思考エンジン 1 本
pub trait EngineClient: Send {
    /// 探索する。`on_event` は multipv=1 の評価イベントごとに呼ばれる。
    ///
    /// `cancel` が立ったら速やかに探索を打ち切り、`cancelled = true` で返す。
    fn search(
        &mut self,
        request: &SearchRequest,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(&EvalEvent),
    ) -> Result<EngineOutcome>;

    fn name(&self) -> &str;
}

/// ワーカーごとにエンジンを作る
pub trait EngineFactory: Send + Sync {
    fn create(&self, worker_index: usize) -> Result<Box<dyn EngineClient>>;
}
