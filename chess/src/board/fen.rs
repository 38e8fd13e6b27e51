use super::Board;
use crate::core::*;

/// Standard starting position
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// A tactical middlegame used by tests that want a busy board
pub const KIWIPETE_FEN: &str =
    "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1";

impl Board {
    /// Builds a board from a FEN string
    pub fn from_fen(fen: &str) -> Result<Board, FenError> {
        let mut board = Board::new();
        board.set(fen)?;
        Ok(board)
    }

    /// Resets the board to the position described by `fen`. Move counters
    /// are accepted but ignored; repetition bookkeeping is not this
    /// crate's concern.
    pub fn set(&mut self, fen: &str) -> Result<(), FenError> {
        let mut fields = fen.split_whitespace();

        let placement = fields.next().ok_or(FenError::MissingField("board"))?;
        let stm = fields.next().ok_or(FenError::MissingField("side to move"))?;
        let castling = fields.next().ok_or(FenError::MissingField("castling"))?;
        let enpassant = fields.next().ok_or(FenError::MissingField("en passant"))?;

        *self = Board::new();

        let ranks: Vec<&str> = placement.split('/').collect();
        if ranks.len() != 8 {
            return Err(FenError::BadRankCount(ranks.len()));
        }

        for (i, rank_str) in ranks.iter().enumerate() {
            let rank = Rank::from_unchecked(7 - i as u8);
            let mut file = 0u8;
            for c in rank_str.chars() {
                if let Some(skip) = c.to_digit(10) {
                    file += skip as u8;
                } else {
                    let piece = Piece::from_char(c).ok_or(FenError::InvalidPiece(c))?;
                    if file >= 8 {
                        return Err(FenError::BadRankWidth(rank_str.to_string()));
                    }
                    let sq = Square::from_parts(File::from_unchecked(file), rank);
                    self.set_piece(piece, sq);
                    file += 1;
                }
            }
            if file != 8 {
                return Err(FenError::BadRankWidth(rank_str.to_string()));
            }
        }

        self.stm = match stm {
            "w" => Colour::White,
            "b" => Colour::Black,
            other => return Err(FenError::InvalidSideToMove(other.to_string())),
        };

        self.castle = Castling::NONE;
        if castling != "-" {
            for c in castling.chars() {
                self.castle = self.castle
                    | match c {
                        'K' => Castling::WK,
                        'Q' => Castling::WQ,
                        'k' => Castling::BK,
                        'q' => Castling::BQ,
                        _ => return Err(FenError::InvalidCastling(castling.to_string())),
                    };
            }
        }

        self.enpassant = match enpassant {
            "-" => None,
            sq => Some(sq.parse::<Square>()?),
        };

        self.key = self.compute_key();
        Ok(())
    }
}

/******************************************\
|==========================================|
|                Unit Tests                |
|==========================================|
\******************************************/

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startpos_parses() {
        let board = Board::from_fen(START_FEN).unwrap();
        assert_eq!(board.stm(), Colour::White);
        assert_eq!(board.castling(), Castling::ALL);
        assert_eq!(board.ep_square(), None);
        assert_eq!(board.all_occupied().count_bits(), 32);
    }

    #[test]
    fn test_kiwipete_parses() {
        let board = Board::from_fen(KIWIPETE_FEN).unwrap();
        assert_eq!(board.on(Square::E5), Some(Piece::WhiteKnight));
        assert_eq!(board.on(Square::A6), Some(Piece::BlackBishop));
        assert_eq!(board.king_square(Colour::White), Square::E1);
        assert_eq!(board.key(), board.compute_key());
    }

    #[test]
    fn test_ep_field() {
        let board =
            Board::from_fen("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq d6 0 2")
                .unwrap();
        assert_eq!(board.ep_square(), Some(Square::D6));
    }

    #[test]
    fn test_bad_fens_rejected() {
        assert!(Board::from_fen("").is_err());
        assert!(Board::from_fen("8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Board::from_fen("9/8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Board::from_fen("x7/8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Board::from_fen("8/8/8/8/8/8/8/8 z - - 0 1").is_err());
    }
}
