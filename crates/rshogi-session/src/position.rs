//! 局面値と局面サービス境界
//!
//! 盤面のルール（合法手生成・王手判定・SFEN 変換）はこのクレートでは実装せず、
//! [`PositionService`] 越しに利用する。ここで扱う [`Position`] はサービスが返した
//! スナップショットで、ツリーや時計が保持するのは常に複製した値になる。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Color, PassRights};

/// 盤上の駒
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Piece {
    pub owner: Color,
    /// "K" | "R" | "B" | "G" | "S" | "N" | "L" | "P"
    #[serde(rename = "type")]
    pub piece_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub promoted: bool,
}

/// 盤面の1マス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cell {
    /// "9a" ~ "1i" 形式
    pub square: String,
    pub piece: Option<Piece>,
}

/// 持ち駒（駒種ごとの枚数）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Hand {
    #[serde(rename = "P", default)]
    pub pawn: u32,
    #[serde(rename = "L", default)]
    pub lance: u32,
    #[serde(rename = "N", default)]
    pub knight: u32,
    #[serde(rename = "S", default)]
    pub silver: u32,
    #[serde(rename = "G", default)]
    pub gold: u32,
    #[serde(rename = "B", default)]
    pub bishop: u32,
    #[serde(rename = "R", default)]
    pub rook: u32,
}

/// 両者の持ち駒
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Hands {
    pub sente: Hand,
    pub gote: Hand,
}

/// 局面スナップショット
///
/// 盤面（9x9）・持ち駒・手番・手数・パス権（有効時のみ）を持つ。
/// 内容の解釈は局面サービスに任せ、コア側は手番・手数・パス権だけを読む。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// 9x9のセル配列（0:1筋〜8:9筋、0:1段〜8:9段）
    pub cells: Vec<Vec<Cell>>,
    pub hands: Hands,
    pub turn: Color,
    /// 開始局面からの手数（開始局面 = 0）
    pub ply: u32,
    /// 残りパス権。パスルール無効の対局では `None`。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_rights: Option<PassRights>,
}

impl Position {
    /// 盤面を持たない局面（テストやダミーの開始局面用）
    pub fn empty(turn: Color, ply: u32) -> Self {
        Self {
            cells: Vec::new(),
            hands: Hands::default(),
            turn,
            ply,
            pass_rights: None,
        }
    }

    pub fn side_to_move(&self) -> Color {
        self.turn
    }

    /// 手番側の残りパス権。パスルール無効なら `None`。
    pub fn pass_rights_for_side_to_move(&self) -> Option<u8> {
        self.pass_rights.map(|r| r.get(self.turn))
    }
}

/// 合法手問い合わせ / 再生のオプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegalQueryOptions {
    /// パス権の「初期値」（残り回数ではない）。サービスが棋譜を再生して残りを求める。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_rights: Option<PassRights>,
}

/// 棋譜リプレイ結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    /// 適用できた指し手（先頭から）
    pub applied: Vec<String>,
    /// 最後に適用できた指し手まで進めた局面
    pub position: Position,
    /// 途中で止まった場合の理由
    pub error: Option<String>,
}

impl ReplayResult {
    /// すべての指し手が適用されたか
    pub fn is_complete(&self, requested: usize) -> bool {
        self.error.is_none() && self.applied.len() == requested
    }
}

/// 局面サービス（ルールエンジン）
///
/// `start` は SFEN 文字列または `"startpos"`。エラーはユーザー向けメッセージ。
pub trait PositionService: Send + Sync {
    /// 平手初期局面
    fn initial_board(&self) -> Result<Position, String>;

    fn parse_sfen(&self, sfen: &str) -> Result<Position, String>;

    fn board_to_sfen(&self, position: &Position) -> Result<String, String>;

    fn legal_moves(
        &self,
        start: &str,
        moves: &[String],
        options: LegalQueryOptions,
    ) -> Result<HashSet<String>, String>;

    fn replay_moves_strict(
        &self,
        start: &str,
        moves: &[String],
        options: LegalQueryOptions,
    ) -> Result<ReplayResult, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_json_uses_camel_case_and_sente_gote() {
        let mut pos = Position::empty(Color::White, 3);
        pos.pass_rights = Some(PassRights::new(2, 1));
        let json = serde_json::to_value(&pos).unwrap();
        assert_eq!(json["turn"], "gote");
        assert_eq!(json["passRights"]["sente"], 2);
        assert_eq!(pos.pass_rights_for_side_to_move(), Some(1));

        let back: Position = serde_json::from_value(json).unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn replay_result_completeness() {
        let result = ReplayResult {
            applied: vec!["7g7f".to_string()],
            position: Position::empty(Color::White, 1),
            error: None,
        };
        assert!(result.is_complete(1));
        assert!(!result.is_complete(2));
    }
}
