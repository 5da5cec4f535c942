//! 手番・パス権・評価値などの共通型

use serde::{Deserialize, Serialize};

/// 手番（先手/後手）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Color {
    #[serde(rename = "sente")]
    Black = 0,
    #[serde(rename = "gote")]
    White = 1,
}

impl Color {
    /// 相手番を返す
    #[inline]
    pub const fn opponent(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    /// UI / 設定ファイルで使う表記
    pub const fn label(self) -> &'static str {
        match self {
            Color::Black => "sente",
            Color::White => "gote",
        }
    }

    /// 手数（1 始まりの ply を指した直後）から次の手番を求める。
    /// 開始局面の手番 `start` を基準にする。
    pub const fn after_plies(start: Color, plies: u32) -> Color {
        if plies % 2 == 0 { start } else { start.opponent() }
    }
}

impl std::ops::Not for Color {
    type Output = Color;

    #[inline]
    fn not(self) -> Color {
        self.opponent()
    }
}

/// パス権（先手, 後手）の残り回数
///
/// 局面サービスへは常に「初期値」を渡し、残り回数はサービス側が棋譜を再生して求める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassRights {
    pub sente: u8,
    pub gote: u8,
}

impl PassRights {
    pub const fn new(sente: u8, gote: u8) -> Self {
        Self { sente, gote }
    }

    pub const fn get(&self, side: Color) -> u8 {
        match side {
            Color::Black => self.sente,
            Color::White => self.gote,
        }
    }

    /// 1 回消費した値を返す。0 のときは 0 のまま。
    pub const fn consumed(self, side: Color) -> Self {
        match side {
            Color::Black => Self {
                sente: self.sente.saturating_sub(1),
                gote: self.gote,
            },
            Color::White => Self {
                sente: self.sente,
                gote: self.gote.saturating_sub(1),
            },
        }
    }
}

/// 評価値（USI の `score cp` / `score mate`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    /// 符号を反転する（視点の入れ替え）
    pub const fn flipped(self) -> Score {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(m) => Score::Mate(-m),
        }
    }

    /// 手番側視点の値を先手視点に揃える
    pub const fn from_sente_view(self, side_to_move: Color) -> Score {
        match side_to_move {
            Color::Black => self,
            Color::White => self.flipped(),
        }
    }
}

/// エンジンが `info` 行ごとに流す評価イベント（multipv=1 のみ）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seldepth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pv: Vec<String>,
}

impl EvalEvent {
    pub fn cp(score_cp: i32, depth: u32) -> Self {
        Self {
            score: Some(Score::Cp(score_cp)),
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn mate(score_mate: i32, depth: u32) -> Self {
        Self {
            score: Some(Score::Mate(score_mate)),
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn with_pv<I, S>(mut self, pv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pv = pv.into_iter().map(Into::into).collect();
        self
    }

    /// info 行を解析する。multipv=1 以外の行・info 以外の行は `None`。
    pub fn from_info_line(line: &str) -> Option<Self> {
        let mut event = EvalEvent::default();
        if event.update_from_line(line) { Some(event) } else { None }
    }

    /// info 行を解析し、multipv=1 の情報を上書きする。反映したら `true`。
    pub fn update_from_line(&mut self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some("info") {
            return false;
        }
        let mut idx = 1;
        while idx + 1 < tokens.len() {
            if tokens[idx] == "multipv" {
                if tokens[idx + 1].parse::<u32>().unwrap_or(1) != 1 {
                    return false;
                }
                break;
            }
            idx += 1;
        }
        let mut i = 1;
        while i < tokens.len() {
            let next = tokens.get(i + 1).copied();
            match tokens[i] {
                "depth" => {
                    self.depth = next.and_then(|t| t.parse().ok());
                    i += 1;
                }
                "seldepth" => {
                    self.seldepth = next.and_then(|t| t.parse().ok());
                    i += 1;
                }
                "nodes" => {
                    self.nodes = next.and_then(|t| t.parse().ok());
                    i += 1;
                }
                "time" => {
                    self.time_ms = next.and_then(|t| t.parse().ok());
                    i += 1;
                }
                "score" => {
                    let value = tokens.get(i + 2).and_then(|t| t.parse::<i32>().ok());
                    match (next, value) {
                        (Some("cp"), Some(v)) => self.score = Some(Score::Cp(v)),
                        (Some("mate"), Some(v)) => self.score = Some(Score::Mate(v)),
                        _ => {}
                    }
                    i += 2;
                }
                "pv" => {
                    let pv: Vec<String> = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                    if !pv.is_empty() {
                        self.pv = pv;
                    }
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        true
    }
}

/// ノードに保存する解析結果
///
/// `score` は解析局面の手番側視点、`normalized` は先手視点。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEval {
    pub score: Score,
    pub depth: u32,
    pub normalized: Score,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pv: Vec<String>,
}

impl NodeEval {
    /// 評価イベントから作る。スコアのないイベントは `None`。
    pub fn from_event(event: &EvalEvent, side_to_move: Color) -> Option<Self> {
        let score = event.score?;
        Some(Self {
            score,
            depth: event.depth.unwrap_or(0),
            normalized: score.from_sente_view(side_to_move),
            pv: event.pv.clone(),
        })
    }
}
