//! 将棋 GUI の対局進行コア
//!
//! 変化手順付きの棋譜ツリー、秒読み付きの対局時計、合法手キャッシュ、
//! 並列解析プールと、それらを束ねる対局シーケンサ [`MatchSession`] を提供する。
//! 盤面のルール判定は [`PositionService`]、思考は [`EngineClient`] として外から注入する。

pub mod analysis;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod kifu;
pub mod legal_cache;
pub mod position;
pub mod record;
pub mod session;
pub mod types;

pub use analysis::{AnalysisEvent, AnalysisJob, AnalysisSettings, EnginePool};
pub use clock::{ClockManager, ClockPreset, ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{Controller, SessionConfig};
pub use engine::{CancelToken, EngineClient, EngineFactory, SearchRequest};
pub use error::{PoolError, RecordError, SessionError, SettingsError};
pub use kifu::{KifuTree, NodeId};
pub use position::{Position, PositionService};
pub use session::{MatchSession, Mode, SessionEvent, SharedSession};
pub use types::{Color, EvalEvent, PassRights, Score};
