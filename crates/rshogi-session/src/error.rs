//! エラー型
//!
//! コンポーネント境界で回復できる失敗はすべてここの列挙型で表現する。
//! ファイル I/O やエンジンプロセス起動のような外縁の処理だけが `anyhow` を使う。

use thiserror::Error;

use crate::kifu::NodeId;

/// 対局シーケンサ / 棋譜ツリー / 合法手キャッシュのエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// 合法手判定または局面サービスが指し手を拒否した
    #[error("rejected move: {0}")]
    Rejected(String),

    /// 合法手の取得に失敗した（キャッシュには残らない）
    #[error("legal move resolution failed: {0}")]
    Resolution(String),

    /// 局面 ↔ 表記の変換に失敗した
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// 指し手トークンの書式が不正
    #[error(transparent)]
    Record(#[from] RecordError),

    /// ツリーに存在しないノード（リセット済みの可能性がある）
    #[error("unknown kifu node: {0}")]
    UnknownNode(NodeId),

    /// 現在の手順上にその手数のノードがない
    #[error("no node at ply {0} on the current line")]
    NoSuchPly(u32),

    /// 現在のモードでは受け付けない操作
    #[error("operation not allowed while {0}")]
    InvalidMode(&'static str),

    /// 手番でない側の指し手、または時計・手番と合わない依頼
    #[error("not {0}'s turn")]
    NotYourTurn(&'static str),

    /// パスが無効化されている、または残り回数がない
    #[error("pass is not available: {0}")]
    PassUnavailable(String),

    /// 手番・局面が変わった後に届いたエンジンの指し手（適用せず捨てる）
    #[error("stale engine move '{0}' discarded")]
    StaleEngineMove(String),

    /// 解析プールを使えない / バッチ実行中
    #[error(transparent)]
    Analysis(#[from] PoolError),
}

/// 棋譜表記（指し手トークン / position 行）の解析エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid move token '{0}'")]
    InvalidToken(String),

    #[error("invalid square '{0}'")]
    InvalidSquare(String),

    #[error("missing SFEN payload")]
    MissingSfen,

    #[error("expected 'moves' before move list, got '{0}'")]
    ExpectedMoves(String),

    #[error("expected 'startpos' or 'sfen', got {0:?}")]
    UnknownStart(Option<String>),
}

/// 解析プールのエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// プール構築時にエンジンを 1 本も起動できなかった（バッチ開始にとって致命的）
    #[error("analysis engine unavailable: {0}")]
    EngineUnavailable(String),

    /// 既にバッチが走っている
    #[error("an analysis batch is already running")]
    BatchRunning,

    /// プールサイズ 0
    #[error("pool size must be at least 1")]
    EmptyPool,

    /// 1 ジョブの失敗（バッチは継続する）
    #[error("analysis job failed: {0}")]
    Job(String),
}

/// 設定ストアのエラー
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
