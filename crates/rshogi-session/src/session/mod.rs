//! 対局シーケンサ
//!
//! 棋譜ツリー・時計・パス権への書き込みはすべて [`MatchSession`] を通す。
//! 指し手 / 待った / パスは同時に 1 つだけ処理し、重なった要求は [`SharedSession`]
//! で読み捨てる。エンジンの指し手と解析結果はチャネル経由で届き、
//! [`MatchSession::process_pending`] でシーケンサ自身が取り込む。

mod match_session;
mod opponent;
mod shared;

use serde::Serialize;

use crate::analysis::AnalysisEvent;
use crate::kifu::{BranchCreated, NodeId};
use crate::record::Square;
use crate::types::Color;

pub use match_session::MatchSession;
pub use opponent::{EngineReply, EngineTicket};
pub use shared::{Guarded, SharedSession};

/// 対局モード。`Reviewing` は他のどれでもない状態（保存はしない）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Editing,
    Playing,
    Paused,
    Reviewing,
}

impl Mode {
    pub const fn label(self) -> &'static str {
        match self {
            Mode::Editing => "editing",
            Mode::Playing => "playing",
            Mode::Paused => "paused",
            Mode::Reviewing => "reviewing",
        }
    }
}

/// 対局結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameOutcome {
    SenteWin,
    GoteWin,
    Draw,
}

impl GameOutcome {
    pub const fn win_for(side: Color) -> Self {
        match side {
            Color::Black => GameOutcome::SenteWin,
            Color::White => GameOutcome::GoteWin,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            GameOutcome::SenteWin => "sente_win",
            GameOutcome::GoteWin => "gote_win",
            GameOutcome::Draw => "draw",
        }
    }
}

/// 終局理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    Resign,
    IllegalMove,
    DeclareWin,
}

impl EndReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            EndReason::Timeout => "timeout",
            EndReason::Resign => "resign",
            EndReason::IllegalMove => "illegal_move",
            EndReason::DeclareWin => "declare_win",
        }
    }
}

/// 画面側が拾う出来事
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MoveApplied {
        node_id: NodeId,
        ply: u32,
        usi_move: String,
        side: Color,
    },
    /// 新しい分岐 1 つにつき 1 回
    BranchCreated(BranchCreated),
    Undone {
        rewound: u32,
        side_to_move: Color,
    },
    ModeChanged(Mode),
    TimeExpired(Color),
    GameOver {
        outcome: GameOutcome,
        reason: EndReason,
    },
    /// 局面が変わった後に届いたエンジンの指し手
    EngineMoveDiscarded {
        usi_move: Option<String>,
        side: Color,
    },
    EngineFailed(String),
    EvalRecorded {
        node_id: NodeId,
        ply: u32,
    },
    /// リセット済みのツリーに向けた解析結果
    AnalysisDropped {
        ply: u32,
    },
    /// 解析プールのエラー / 進捗 / 完了
    Analysis(AnalysisEvent),
}

/// 盤面操作からの指し手入力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveInput {
    /// `promote`: `None` なら成り / 不成を選べるときに問い合わせる
    Board {
        from: Square,
        to: Square,
        promote: Option<bool>,
    },
    Drop {
        piece: char,
        to: Square,
    },
}

impl MoveInput {
    pub fn board(from: Square, to: Square) -> Self {
        MoveInput::Board {
            from,
            to,
            promote: None,
        }
    }
}

/// 成りの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// 成れない
    None,
    /// 成らなければならない
    Forced,
    /// どちらも可
    Optional,
}

/// 適用した指し手
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    pub node_id: NodeId,
    pub usi_move: String,
    pub ply: u32,
    pub branch: Option<BranchCreated>,
}

/// `apply_move` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveResult {
    Applied(AppliedMove),
    /// 成り / 不成の選択が必要（状態は変えていない）
    PromotionChoiceRequired { from: Square, to: Square },
}

/// 待ったの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoOutcome {
    pub rewound: u32,
    pub side_to_move: Color,
}
