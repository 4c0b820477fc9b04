use std::iter::repeat;

use crate::types::PieceIndex;

/// Bitmap of piece indexes, least significant bit first within each byte.
/// Grows on demand; bits beyond the backing bytes read as clear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PieceMap(Vec<u8>);

impl PieceMap {
    pub fn new() -> PieceMap {
        Self(vec![])
    }

    pub fn with_capacity(n_pieces: usize) -> PieceMap {
        Self(vec![0u8; Self::capacity(n_pieces)])
    }

    /// Number of bytes needed to hold `n_pieces` bits.
    pub fn capacity(n_pieces: usize) -> usize {
        n_pieces / 8 + if n_pieces % 8 != 0 { 1 } else { 0 }
    }

    pub fn get(&self, bit_index: PieceIndex) -> bool {
        let (byte_index, bit_offset_in_byte) = Self::locate(bit_index);
        match self.0.get(byte_index) {
            Some(b) => b & 1 << bit_offset_in_byte != 0,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0u8)
    }

    pub fn set(&mut self, bit_index: PieceIndex) {
        let (byte_index, bit_offset_in_byte) = Self::locate(bit_index);
        if self.0.len() <= byte_index {
            self.0
                .extend(repeat(0u8).take(byte_index - self.0.len() + 1));
        }
        self.0[byte_index] |= 1 << bit_offset_in_byte;
    }

    pub fn clear(&mut self, bit_index: PieceIndex) {
        let (byte_index, bit_offset_in_byte) = Self::locate(bit_index);
        if let Some(b) = self.0.get_mut(byte_index) {
            *b &= !(1 << bit_offset_in_byte);
        }
    }

    pub fn reset(&mut self) {
        self.0 = vec![];
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.0.iter().enumerate().flat_map(|(byte_index, b)| {
            (0..8u32)
                .filter(move |bit| b & (1 << bit) != 0)
                .map(move |bit| byte_index as PieceIndex * 8 + bit)
        })
    }

    fn locate(bit_index: PieceIndex) -> (usize, u32) {
        ((bit_index / 8) as usize, bit_index % 8)
    }
}

impl From<Vec<u8>> for PieceMap {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for PieceMap {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<PieceMap> for Vec<u8> {
    fn from(value: PieceMap) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for PieceMap {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl FromIterator<PieceIndex> for PieceMap {
    fn from_iter<T: IntoIterator<Item = PieceIndex>>(iter: T) -> Self {
        let mut map = PieceMap::new();
        for piece_index in iter {
            map.set(piece_index);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::PieceMap;

    #[test]
    fn empty_piece_map() {
        let piece_map = PieceMap::new();
        assert_eq!(piece_map.get(0), false);
        assert_eq!(piece_map.get(21389213), false);
        assert!(piece_map.is_empty());
        assert!(PieceMap::with_capacity(100).is_empty());
    }

    #[test]
    fn non_empty_piece_map() {
        let mut piece_map = PieceMap::new();
        piece_map.set(999);
        assert_eq!(piece_map.get(999), true);
        assert!(!piece_map.is_empty());

        let bytes: Vec<u8> = piece_map.clone().into();
        assert_eq!(bytes.len(), 125);

        piece_map.set(1000);
        assert_eq!(piece_map.get(1000), true);

        let bytes: Vec<u8> = piece_map.clone().into();
        assert_eq!(bytes.len(), 126);

        assert_eq!(piece_map.get(0), false);
        assert_eq!(piece_map.get(998), false);
        assert_eq!(piece_map.get(1008), false);
        assert_eq!(piece_map.count(), 2);
    }

    #[test]
    fn clear_and_reset() {
        let mut piece_map = PieceMap::new();
        piece_map.set(7);
        piece_map.set(1000);
        piece_map.clear(7);
        piece_map.clear(5000);
        assert_eq!(piece_map.get(7), false);
        assert_eq!(piece_map.get(1000), true);
        piece_map.reset();
        assert_eq!(piece_map.get(1000), false);
    }

    #[test]
    fn iter_ascending() {
        let piece_map: PieceMap = [17, 3, 9, 0].into_iter().collect();
        assert_eq!(piece_map.iter().collect::<Vec<_>>(), vec![0, 3, 9, 17]);
    }

    #[test]
    fn byte_representation() {
        let piece_map: PieceMap = [0x55u8; 32].as_slice().into();
        for i in 0..256 {
            assert_eq!(piece_map.get(i), i % 2 == 0, "bit {} was {}", i, piece_map.get(i));
        }
        assert_eq!(piece_map.count(), 128);
    }
}
