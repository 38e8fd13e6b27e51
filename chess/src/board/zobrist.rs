use crate::core::*;
use crate::utils::PRNG;

/******************************************\
|==========================================|
|              Key Definition              |
|==========================================|
\******************************************/

/// 64-bit Zobrist key. The transposition table uses the upper bits for
/// cluster selection and the low 16 bits as the in-cluster tag.
pub type Key = u64;

/******************************************\
|==========================================|
|              Zobrist Table               |
|==========================================|
\******************************************/

/// Precomputed random keys for every hashable state element. Built once at
/// compile time; read-only afterwards.
#[derive(Debug)]
pub struct ZobristTable {
    /// Keys per piece per square: `pieces[piece][square]`
    pub pieces: [[Key; Square::NUM]; Piece::NUM],
    /// Key toggled when black is to move
    pub side_to_move: Key,
    /// Keys per castling rights mask
    pub castling: [Key; Castling::NUM],
    /// Keys per en passant file
    pub enpassant: [Key; File::NUM],
}

pub const ZOBRIST: ZobristTable = init_zobrist_table();

const fn init_zobrist_table() -> ZobristTable {
    let mut rng = PRNG::new(0x9E37_79B9_7F4A_7C15);

    let mut pieces = [[0; Square::NUM]; Piece::NUM];
    let mut castling = [0; Castling::NUM];
    let mut enpassant = [0; File::NUM];

    let mut i = 0;
    while i < Piece::NUM {
        let mut j = 0;
        while j < Square::NUM {
            pieces[i][j] = rng.random_u64();
            j += 1;
        }
        i += 1;
    }

    let side_to_move = rng.random_u64();

    let mut i = 0;
    while i < Castling::NUM {
        castling[i] = rng.random_u64();
        i += 1;
    }

    let mut i = 0;
    while i < File::NUM {
        enpassant[i] = rng.random_u64();
        i += 1;
    }

    ZobristTable {
        pieces,
        side_to_move,
        castling,
        enpassant,
    }
}

/******************************************\
|==========================================|
|               Key Helpers                |
|==========================================|
\******************************************/

#[inline]
pub fn piece_key(piece: Piece, sq: Square) -> Key {
    ZOBRIST.pieces[piece.index()][sq.index()]
}

#[inline]
pub fn side_key() -> Key {
    ZOBRIST.side_to_move
}

#[inline]
pub fn castle_key(rights: Castling) -> Key {
    ZOBRIST.castling[rights.index()]
}

#[inline]
pub fn ep_key(file: File) -> Key {
    ZOBRIST.enpassant[file.index()]
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
    fn test_keys_are_distinct() {
        // A full collision scan is overkill; spot check a handful of cells.
        assert_ne!(
            piece_key(Piece::WhitePawn, Square::E2),
            piece_key(Piece::WhitePawn, Square::E4)
        );
        assert_ne!(
            piece_key(Piece::WhitePawn, Square::E2),
            piece_key(Piece::BlackPawn, Square::E2)
        );
        assert_ne!(side_key(), 0);
    }

    #[test]
    fn test_table_is_stable() {
        // The table is a compile-time constant; two reads must agree.
        assert_eq!(
            piece_key(Piece::BlackQueen, Square::D8),
            ZOBRIST.pieces[Piece::BlackQueen.index()][Square::D8.index()]
        );
    }
}
