//! 棋譜表記
//!
//! - 指し手トークン: `<from><to>[+]`（盤上の移動）、`<駒>*<to>`（打ち）、`pass`、`none`（null）
//! - 棋譜: `<開始表記> moves <token> <token> …`（先頭の `position` は省略可）
//! - 取り込み: 開始表記・指し手列・手ごとのメタデータ（消費時間 / 評価値 / 深さ）に分解した形
//! - 書き出し: 本譜を 1 手 1 行の JSONL にする

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::types::{Color, NodeEval};

/// 盤上のマス（筋 1-9, 段 a-i）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    file: u8,
    rank: u8,
}

impl Square {
    pub fn new(file: u8, rank: u8) -> Option<Self> {
        if (1..=9).contains(&file) && (1..=9).contains(&rank) {
            Some(Self { file, rank })
        } else {
            None
        }
    }

    pub fn file(self) -> u8 {
        self.file
    }

    pub fn rank(self) -> u8 {
        self.rank
    }

    fn parse(s: &str) -> Result<Self, RecordError> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(RecordError::InvalidSquare(s.to_string()));
        }
        let file = bytes[0].wrapping_sub(b'0');
        let rank = bytes[1].wrapping_sub(b'a').wrapping_add(1);
        Square::new(file, rank).ok_or_else(|| RecordError::InvalidSquare(s.to_string()))
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.file, (b'a' + self.rank - 1) as char)
    }
}

impl FromStr for Square {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Square::parse(s)
    }
}

const DROP_PIECES: [char; 7] = ['P', 'L', 'N', 'S', 'G', 'B', 'R'];

/// 指し手トークン
///
/// ツリーへの挿入時に 1 回だけ解析され、不正なトークンは状態を変更する前に弾かれる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveToken {
    Board { from: Square, to: Square, promote: bool },
    Drop { piece: char, to: Square },
    Pass,
    Null,
}

impl MoveToken {
    pub fn parse(token: &str) -> Result<Self, RecordError> {
        let invalid = || RecordError::InvalidToken(token.to_string());
        match token {
            "pass" => return Ok(MoveToken::Pass),
            "none" | "0000" => return Ok(MoveToken::Null),
            _ => {}
        }
        if let Some((piece, to)) = token.split_once('*') {
            let mut chars = piece.chars();
            let piece = match (chars.next(), chars.next()) {
                (Some(c), None) if DROP_PIECES.contains(&c) => c,
                _ => return Err(invalid()),
            };
            let to = Square::parse(to).map_err(|_| invalid())?;
            return Ok(MoveToken::Drop { piece, to });
        }
        if !token.is_ascii() {
            return Err(invalid());
        }
        let (body, promote) = match token.strip_suffix('+') {
            Some(body) => (body, true),
            None => (token, false),
        };
        if body.len() != 4 {
            return Err(invalid());
        }
        let from = Square::parse(&body[..2]).map_err(|_| invalid())?;
        let to = Square::parse(&body[2..]).map_err(|_| invalid())?;
        if from == to {
            return Err(invalid());
        }
        Ok(MoveToken::Board { from, to, promote })
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, MoveToken::Pass)
    }

    /// USI 表記
    pub fn to_usi(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MoveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveToken::Board { from, to, promote } => {
                write!(f, "{from}{to}{}", if *promote { "+" } else { "" })
            }
            MoveToken::Drop { piece, to } => write!(f, "{piece}*{to}"),
            MoveToken::Pass => f.write_str("pass"),
            MoveToken::Null => f.write_str("none"),
        }
    }
}

impl FromStr for MoveToken {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoveToken::parse(s)
    }
}

/// `<開始表記> moves …` を分解した棋譜
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    /// `"startpos"` または SFEN
    pub start: String,
    pub moves: Vec<String>,
}

impl GameRecord {
    pub fn new(start: impl Into<String>, moves: Vec<String>) -> Self {
        Self {
            start: start.into(),
            moves,
        }
    }

    /// 棋譜行をパースする。先頭の `position` と `sfen` キーワードは省略可。
    /// 指し手トークンは書式まで検証する。
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let mut tokens = line.split_whitespace().peekable();
        if tokens.peek().is_some_and(|tok| *tok == "position") {
            tokens.next();
        }
        let start = match tokens.peek().copied() {
            Some("startpos") => {
                tokens.next();
                "startpos".to_string()
            }
            Some(_) => {
                if tokens.peek().is_some_and(|tok| *tok == "sfen") {
                    tokens.next();
                }
                let mut sfen_tokens = Vec::new();
                while let Some(token) = tokens.peek() {
                    if *token == "moves" {
                        break;
                    }
                    sfen_tokens.push(*token);
                    tokens.next();
                }
                if sfen_tokens.is_empty() {
                    return Err(RecordError::MissingSfen);
                }
                sfen_tokens.join(" ")
            }
            None => return Err(RecordError::UnknownStart(None)),
        };
        let moves = parse_moves(tokens)?;
        Ok(Self { start, moves })
    }

    /// `<開始表記> moves …` を組み立てる（指し手がなければ開始表記のみ）
    pub fn to_notation(&self) -> String {
        if self.moves.is_empty() {
            self.start.clone()
        } else {
            format!("{} moves {}", self.start, self.moves.join(" "))
        }
    }

    /// エンジンへ送る `position …` コマンド
    pub fn to_usi_position(&self) -> String {
        let mut buf = String::from("position ");
        if self.start == "startpos" {
            buf.push_str("startpos");
        } else {
            buf.push_str("sfen ");
            buf.push_str(&self.start);
        }
        if !self.moves.is_empty() {
            buf.push_str(" moves ");
            buf.push_str(&self.moves.join(" "));
        }
        buf
    }
}

impl fmt::Display for GameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_notation())
    }
}

/// moves トークン以降を指し手列として回収する。
fn parse_moves<'a, I>(iter: I) -> Result<Vec<String>, RecordError>
where
    I: Iterator<Item = &'a str>,
{
    let mut iter = iter.peekable();
    match iter.peek() {
        Some(&"moves") => {
            iter.next();
            iter.map(|mv| MoveToken::parse(mv).map(|t| t.to_usi())).collect()
        }
        Some(other) => Err(RecordError::ExpectedMoves(other.to_string())),
        None => Ok(Vec::new()),
    }
}

/// 取り込み時の 1 手分
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedMove {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_cp: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_mate: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl ImportedMove {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }
}

/// 外部の棋譜形式を分解した取り込み用の形
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportedRecord {
    pub start: String,
    pub moves: Vec<ImportedMove>,
}

impl From<GameRecord> for ImportedRecord {
    fn from(record: GameRecord) -> Self {
        Self {
            start: record.start,
            moves: record.moves.into_iter().map(ImportedMove::new).collect(),
        }
    }
}

/// JSONL 書き出しのヘッダ行
#[derive(Debug, Serialize)]
pub struct RecordMeta {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub start: String,
    pub sente: String,
    pub gote: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// JSONL 書き出しの 1 手分
#[derive(Debug, Serialize)]
pub struct RecordMoveEntry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ply: u32,
    pub side_to_move: Color,
    pub move_usi: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<NodeEval>,
}

/// ヘッダ行 + 手ごとの行を書き出す
pub fn write_jsonl<W: Write>(
    mut writer: W,
    meta: &RecordMeta,
    entries: &[RecordMoveEntry],
) -> std::io::Result<()> {
    serde_json::to_writer(&mut writer, meta)?;
    writer.write_all(b"\n")?;
    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}
