//! 対局セッションの設定
//!
//! 設定値はキー / 値ストア（[`SettingsStore`]）に `session.*` のキーで保存する。
//! 設定ファイル全体を TOML で読む場合は [`SessionConfig::from_toml_str`] を使う。
//! 時間は読み込み時に旧形式（秒）をミリ秒へ揃える。

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisSettings;
use crate::clock::{ClockPreset, SideClock};
use crate::error::SettingsError;
use crate::types::{Color, PassRights};

/// 手番ごとの指し手の出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    #[default]
    Human,
    Engine,
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Controller::Human => "human",
            Controller::Engine => "engine",
        })
    }
}

impl FromStr for Controller {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Controller::Human),
            "engine" => Ok(Controller::Engine),
            other => Err(format!("expected 'human' or 'engine', got '{other}'")),
        }
    }
}

/// パスルール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassRuleConfig {
    pub enabled: bool,
    pub sente: u8,
    pub gote: u8,
}

impl Default for PassRuleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sente: 2,
            gote: 2,
        }
    }
}

impl PassRuleConfig {
    /// 対局開始時のパス権。無効なら `None`。
    pub fn initial_rights(&self) -> Option<PassRights> {
        self.enabled.then(|| PassRights::new(self.sente, self.gote))
    }
}

/// 解析プールの既定サイズ（画面と対局エンジンのために 1 コア残す）
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_start() -> String {
    "startpos".to_string()
}

/// 対局セッションの設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sente: Controller,
    pub gote: Controller,
    pub clock: ClockPreset,
    pub pass: PassRuleConfig,
    pub pool_size: usize,
    pub analysis: AnalysisSettings,
    /// 新しくできた分岐を自動で解析する
    pub auto_analyze_branches: bool,
    /// 開始局面（`startpos` または SFEN）
    #[serde(default = "default_start")]
    pub start: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sente: Controller::Human,
            gote: Controller::Human,
            clock: ClockPreset::symmetric(600_000, 30_000),
            pass: PassRuleConfig::default(),
            pool_size: default_pool_size(),
            analysis: AnalysisSettings::default(),
            auto_analyze_branches: false,
            start: default_start(),
        }
    }
}

pub mod keys {
    pub const SENTE: &str = "session.sente";
    pub const GOTE: &str = "session.gote";
    pub const SENTE_MAIN_MS: &str = "session.clock.sente.main_ms";
    pub const SENTE_BYOYOMI_MS: &str = "session.clock.sente.byoyomi_ms";
    pub const GOTE_MAIN_MS: &str = "session.clock.gote.main_ms";
    pub const GOTE_BYOYOMI_MS: &str = "session.clock.gote.byoyomi_ms";
    pub const PASS_ENABLED: &str = "session.pass.enabled";
    pub const PASS_SENTE: &str = "session.pass.sente";
    pub const PASS_GOTE: &str = "session.pass.gote";
    pub const POOL_SIZE: &str = "session.pool_size";
    pub const ANALYSIS_TIME_MS: &str = "session.analysis.time_ms";
    pub const ANALYSIS_DEPTH: &str = "session.analysis.depth";
    pub const AUTO_ANALYZE_BRANCHES: &str = "session.auto_analyze_branches";
    pub const START: &str = "session.start";
}

impl SessionConfig {
    pub fn controller(&self, side: Color) -> Controller {
        match side {
            Color::Black => self.sente,
            Color::White => self.gote,
        }
    }

    /// 人間が指す側がちょうど 1 つならその側
    pub fn single_human_side(&self) -> Option<Color> {
        match (self.sente, self.gote) {
            (Controller::Human, Controller::Engine) => Some(Color::Black),
            (Controller::Engine, Controller::Human) => Some(Color::White),
            _ => None,
        }
    }

    fn normalized(mut self) -> Self {
        self.clock = self.clock.normalized();
        self.pool_size = self.pool_size.max(1);
        self
    }

    /// TOML 文書全体から読む（欠けている項目は既定値）
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let config: SessionConfig = toml::from_str(text)?;
        Ok(config.normalized())
    }

    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string(self)?)
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// ストアから読む。キーがなければ既定値のまま。
    pub fn load(store: &dyn SettingsStore) -> Result<Self, SettingsError> {
        let mut config = SessionConfig::default();
        if let Some(v) = read(store, keys::SENTE)? {
            config.sente = v;
        }
        if let Some(v) = read(store, keys::GOTE)? {
            config.gote = v;
        }
        let sente = &mut config.clock.sente;
        load_side(store, keys::SENTE_MAIN_MS, keys::SENTE_BYOYOMI_MS, sente)?;
        let gote = &mut config.clock.gote;
        load_side(store, keys::GOTE_MAIN_MS, keys::GOTE_BYOYOMI_MS, gote)?;
        if let Some(v) = read(store, keys::PASS_ENABLED)? {
            config.pass.enabled = v;
        }
        if let Some(v) = read(store, keys::PASS_SENTE)? {
            config.pass.sente = v;
        }
        if let Some(v) = read(store, keys::PASS_GOTE)? {
            config.pass.gote = v;
        }
        if let Some(v) = read(store, keys::POOL_SIZE)? {
            config.pool_size = v;
        }
        if let Some(v) = read(store, keys::ANALYSIS_TIME_MS)? {
            config.analysis.time_ms = v;
        }
        if let Some(raw) = store.get(keys::ANALYSIS_DEPTH)? {
            config.analysis.depth = if raw.is_empty() {
                None
            } else {
                Some(parse_value(keys::ANALYSIS_DEPTH, &raw)?)
            };
        }
        if let Some(v) = read(store, keys::AUTO_ANALYZE_BRANCHES)? {
            config.auto_analyze_branches = v;
        }
        if let Some(v) = store.get(keys::START)? {
            config.start = v;
        }
        Ok(config.normalized())
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<(), SettingsError> {
        store.set(keys::SENTE, &self.sente.to_string())?;
        store.set(keys::GOTE, &self.gote.to_string())?;
        store.set(keys::SENTE_MAIN_MS, &self.clock.sente.main_ms.to_string())?;
        store.set(keys::SENTE_BYOYOMI_MS, &self.clock.sente.byoyomi_ms.to_string())?;
        store.set(keys::GOTE_MAIN_MS, &self.clock.gote.main_ms.to_string())?;
        store.set(keys::GOTE_BYOYOMI_MS, &self.clock.gote.byoyomi_ms.to_string())?;
        store.set(keys::PASS_ENABLED, &self.pass.enabled.to_string())?;
        store.set(keys::PASS_SENTE, &self.pass.sente.to_string())?;
        store.set(keys::PASS_GOTE, &self.pass.gote.to_string())?;
        store.set(keys::POOL_SIZE, &self.pool_size.to_string())?;
        store.set(keys::ANALYSIS_TIME_MS, &self.analysis.time_ms.to_string())?;
        let depth = self.analysis.depth.map(|d| d.to_string()).unwrap_or_default();
        store.set(keys::ANALYSIS_DEPTH, &depth)?;
        store.set(keys::AUTO_ANALYZE_BRANCHES, &self.auto_analyze_branches.to_string())?;
        store.set(keys::START, &self.start)?;
        Ok(())
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| SettingsError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn read<T>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    store.get(key)?.map(|raw| parse_value(key, &raw)).transpose()
}

fn load_side(
    store: &dyn SettingsStore,
    main_key: &str,
    byoyomi_key: &str,
    side: &mut SideClock,
) -> Result<(), SettingsError> {
    if let Some(v) = read(store, main_key)? {
        side.main_ms = v;
    }
    if let Some(v) = read(store, byoyomi_key)? {
        side.byoyomi_ms = v;
    }
    Ok(())
}

/// 設定のキー / 値ストア（後勝ち）
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// メモリ上のストア
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// 1 枚の TOML テーブルとしてディスクに置くストア。`set` のたびに書き直す。
#[derive(Debug)]
pub struct TomlSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl TomlSettingsStore {
    /// ファイルがなければ空のストアとして開く
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        let text = toml::to_string(&*values)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, text)?;
        Ok(())
    }
}
