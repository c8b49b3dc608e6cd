//! The per-torrent piece selection state: which peers have which pieces, what
//! we already have, and what to ask for next.
//!
//! The picker is the single owner of the availability counters and piece
//! priorities. Peer sessions consult it behind one torrent wide lock, so all
//! updates are atomic with respect to selection queries.

use crate::{Bitfield, PieceIndex};

/// How pieces are chosen for download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceSelection {
    /// Prefer pieces the fewest connected peers have. The default.
    RarestFirst,
    /// Download in piece index order within a sliding window, for streaming.
    /// Pieces outside the window fall back to rarest-first.
    Sequential,
    /// A wrapping cursor over the missing pieces. Only sensible for tests and
    /// very simple swarms.
    RoundRobin,
}

impl Default for PieceSelection {
    fn default() -> Self {
        Self::RarestFirst
    }
}

/// The priority of a piece, derived from file level selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiecePriority {
    /// The piece overlaps no selected file and is never requested.
    DoNotDownload,
    Low,
    Normal,
    High,
    Maximum,
}

/// How many pieces ahead of the window anchor the sequential strategy
/// requests in order.
const SEQUENTIAL_WINDOW_LEN: usize = 64;

#[derive(Clone, Debug)]
struct Piece {
    /// The number of connected peers that have this piece.
    availability: u32,
    priority: PiecePriority,
    /// Whether the piece has been handed to a session for download and is not
    /// resolved yet.
    pending: bool,
    /// Whether the piece is downloaded and hash verified.
    complete: bool,
    /// First and last pieces of files get picked before equally rare pieces,
    /// which lets media players sniff container formats early.
    boost: bool,
}

/// Tracks the piece availability of the swarm and picks pieces to download.
#[derive(Clone, Debug)]
pub(crate) struct PiecePicker {
    /// The pieces we have, i.e. the verified pieces.
    own_pieces: Bitfield,
    pieces: Vec<Piece>,
    selection: PieceSelection,
    /// Round-robin pick position.
    cursor: usize,
}

impl PiecePicker {
    /// Creates a picker for a torrent with no pieces downloaded yet.
    pub fn new(piece_count: usize, selection: PieceSelection) -> Self {
        Self::with_own_pieces(
            Bitfield::repeat(false, piece_count),
            selection,
        )
    }

    /// Creates a picker with some pieces already verified, the resume path.
    pub fn with_own_pieces(
        own_pieces: Bitfield,
        selection: PieceSelection,
    ) -> Self {
        let pieces = own_pieces
            .iter()
            .map(|complete| Piece {
                availability: 0,
                priority: PiecePriority::Normal,
                pending: false,
                complete: *complete,
                boost: false,
            })
            .collect();
        Self {
            own_pieces,
            pieces,
            selection,
            cursor: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn availability(&self, index: PieceIndex) -> u32 {
        self.pieces[index].availability
    }

    pub fn priority(&self, index: PieceIndex) -> PiecePriority {
        self.pieces[index].priority
    }

    pub fn set_priority(&mut self, index: PieceIndex, priority: PiecePriority) {
        self.pieces[index].priority = priority;
    }

    /// Marks a piece as a first-or-last piece of some file, preferring it
    /// among equally rare pieces.
    pub fn boost_piece(&mut self, index: PieceIndex) {
        self.pieces[index].boost = true;
    }

    /// Registers the pieces of a newly announced peer bitfield, increasing
    /// their availability. Returns true if the peer has any piece we still
    /// want.
    pub fn register_peer_pieces(&mut self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        let mut interested = false;
        for (index, has) in pieces.iter().enumerate() {
            if *has {
                self.pieces[index].availability += 1;
                interested |= self.is_wanted(index);
            }
        }
        interested
    }

    /// Registers that a peer announced having a single new piece. Returns
    /// true if it is a piece we still want.
    pub fn register_have(&mut self, index: PieceIndex) -> bool {
        self.pieces[index].availability += 1;
        self.is_wanted(index)
    }

    /// Removes a disconnecting peer's pieces from the availability counts.
    pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        for (index, has) in pieces.iter().enumerate() {
            if *has {
                debug_assert!(self.pieces[index].availability > 0);
                self.pieces[index].availability -= 1;
            }
        }
    }

    /// Whether the peer with the given pieces has anything we still want.
    pub fn interested_in(&self, pieces: &Bitfield) -> bool {
        pieces
            .iter()
            .enumerate()
            .any(|(index, has)| *has && self.is_wanted(index))
    }

    /// Picks the next piece to download from a peer that has the given
    /// pieces, marking it as pending. Returns `None` if the peer has nothing
    /// assignable.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Option<PieceIndex> {
        let index = match self.selection {
            PieceSelection::RarestFirst => self.pick_rarest(peer_pieces),
            PieceSelection::Sequential => self
                .pick_sequential(peer_pieces)
                .or_else(|| self.pick_rarest(peer_pieces)),
            PieceSelection::RoundRobin => self.pick_round_robin(peer_pieces),
        }?;
        self.pieces[index].pending = true;
        Some(index)
    }

    /// Marks the given piece as pending if it is still assignable. Used for
    /// targeted picks (the fast extension's allowed-fast set) that bypass
    /// the strategy.
    pub fn pick_specific(&mut self, index: PieceIndex) -> bool {
        let piece = &mut self.pieces[index];
        if piece.complete
            || piece.pending
            || piece.priority == PiecePriority::DoNotDownload
        {
            return false;
        }
        piece.pending = true;
        true
    }

    /// Marks a piece as downloaded and verified.
    pub fn received_piece(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        piece.pending = false;
        piece.complete = true;
        self.own_pieces.set(index, true);
    }

    /// Puts a piece that failed its hash check (or whose download was
    /// abandoned) back into the assignable pool.
    pub fn reset_piece(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        piece.pending = false;
        piece.complete = false;
        self.own_pieces.set(index, false);
    }

    /// The number of wanted pieces not yet verified, pending downloads
    /// included. The endgame trigger compares this against its threshold.
    pub fn wanted_remaining_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|piece| {
                piece.priority > PiecePriority::DoNotDownload
                    && !piece.complete
            })
            .count()
    }

    /// Whether every wanted piece has been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.wanted_remaining_count() == 0
    }

    fn is_wanted(&self, index: PieceIndex) -> bool {
        let piece = &self.pieces[index];
        piece.priority > PiecePriority::DoNotDownload && !piece.complete
    }

    fn is_assignable(&self, index: PieceIndex, peer_pieces: &Bitfield) -> bool {
        let piece = &self.pieces[index];
        peer_pieces[index]
            && !piece.complete
            && !piece.pending
            && piece.priority > PiecePriority::DoNotDownload
    }

    fn pick_rarest(&self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        let mut best: Option<PieceIndex> = None;
        for index in 0..self.pieces.len() {
            if !self.is_assignable(index, peer_pieces) {
                continue;
            }
            best = match best {
                None => Some(index),
                Some(best_index) => {
                    let piece = &self.pieces[index];
                    let best_piece = &self.pieces[best_index];
                    // higher priority wins, then lower availability, then the
                    // first/last file piece boost
                    let key = (
                        piece.priority,
                        std::cmp::Reverse(piece.availability),
                        piece.boost,
                    );
                    let best_key = (
                        best_piece.priority,
                        std::cmp::Reverse(best_piece.availability),
                        best_piece.boost,
                    );
                    if key > best_key {
                        Some(index)
                    } else {
                        Some(best_index)
                    }
                }
            };
        }
        best
    }

    fn pick_sequential(&self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        // the window is anchored at the first wanted piece we don't have
        let anchor = (0..self.pieces.len()).find(|i| self.is_wanted(*i))?;
        let window_end =
            (anchor + SEQUENTIAL_WINDOW_LEN).min(self.pieces.len());
        (anchor..window_end).find(|i| self.is_assignable(*i, peer_pieces))
    }

    fn pick_round_robin(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        let count = self.pieces.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.is_assignable(index, peer_pieces) {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PIECE_COUNT: usize = 8;

    fn full_bitfield() -> Bitfield {
        Bitfield::repeat(true, PIECE_COUNT)
    }

    fn bitfield_with(indices: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, PIECE_COUNT);
        for index in indices {
            bitfield.set(*index, true);
        }
        bitfield
    }

    #[test]
    fn test_availability_counters() {
        let mut picker =
            PiecePicker::new(PIECE_COUNT, PieceSelection::RarestFirst);

        let peer_a = bitfield_with(&[0, 1, 2]);
        let peer_b = bitfield_with(&[1, 2, 3]);
        assert!(picker.register_peer_pieces(&peer_a));
        assert!(picker.register_peer_pieces(&peer_b));
        picker.register_have(2);

        assert_eq!(picker.availability(0), 1);
        assert_eq!(picker.availability(1), 2);
        assert_eq!(picker.availability(2), 3);
        assert_eq!(picker.availability(3), 1);
        assert_eq!(picker.availability(4), 0);

        picker.unregister_peer_pieces(&peer_a);
        assert_eq!(picker.availability(0), 0);
        assert_eq!(picker.availability(1), 1);
        assert_eq!(picker.availability(2), 2);
    }

    #[test]
    fn test_rarest_first_prefers_low_availability() {
        let mut picker =
            PiecePicker::new(PIECE_COUNT, PieceSelection::RarestFirst);

        // everyone has everything, except piece 5 which one peer is missing
        for _ in 0..3 {
            picker.register_peer_pieces(&full_bitfield());
        }
        picker.unregister_peer_pieces(&bitfield_with(&[5]));

        assert_eq!(picker.pick_piece(&full_bitfield()), Some(5));
    }

    #[test]
    fn test_priority_beats_rarity() {
        let mut picker =
            PiecePicker::new(PIECE_COUNT, PieceSelection::RarestFirst);
        picker.register_peer_pieces(&full_bitfield());
        // piece 3 is common but high priority, piece 6 rare but normal
        picker.register_peer_pieces(&bitfield_with(&[3]));
        picker.set_priority(3, PiecePriority::High);

        assert_eq!(picker.pick_piece(&full_bitfield()), Some(3));
    }

    #[test]
    fn test_do_not_download_never_picked() {
        let mut picker = PiecePicker::new(2, PieceSelection::RarestFirst);
        let all = Bitfield::repeat(true, 2);
        picker.register_peer_pieces(&all);
        picker.set_priority(0, PiecePriority::DoNotDownload);

        assert_eq!(picker.pick_piece(&all), Some(1));
        assert_eq!(picker.pick_piece(&all), None);
        assert_eq!(picker.wanted_remaining_count(), 1);
    }

    #[test]
    fn test_boost_breaks_availability_ties() {
        let mut picker =
            PiecePicker::new(PIECE_COUNT, PieceSelection::RarestFirst);
        picker.register_peer_pieces(&full_bitfield());
        picker.boost_piece(4);

        assert_eq!(picker.pick_piece(&full_bitfield()), Some(4));
    }

    #[test]
    fn test_pending_not_picked_twice() {
        let mut picker = PiecePicker::new(2, PieceSelection::RarestFirst);
        let all = Bitfield::repeat(true, 2);
        picker.register_peer_pieces(&all);

        let first = picker.pick_piece(&all).unwrap();
        let second = picker.pick_piece(&all).unwrap();
        assert_ne!(first, second);
        assert_eq!(picker.pick_piece(&all), None);

        // a hash failure makes the piece assignable again
        picker.reset_piece(first);
        assert_eq!(picker.pick_piece(&all), Some(first));
    }

    #[test]
    fn test_received_piece_updates_own_pieces() {
        let mut picker = PiecePicker::new(3, PieceSelection::RarestFirst);
        let all = Bitfield::repeat(true, 3);
        picker.register_peer_pieces(&all);

        let index = picker.pick_piece(&all).unwrap();
        picker.received_piece(index);

        assert!(picker.own_pieces()[index]);
        assert_eq!(picker.wanted_remaining_count(), 2);
        assert!(!picker.is_complete());
        assert!(picker.interested_in(&all));
    }

    #[test]
    fn test_sequential_picks_in_order() {
        let mut picker =
            PiecePicker::new(PIECE_COUNT, PieceSelection::Sequential);
        let all = full_bitfield();
        picker.register_peer_pieces(&all);

        assert_eq!(picker.pick_piece(&all), Some(0));
        assert_eq!(picker.pick_piece(&all), Some(1));

        // if the peer lacks the next indices, the window still serves the
        // lowest it can
        let sparse = bitfield_with(&[5, 6]);
        assert_eq!(picker.pick_piece(&sparse), Some(5));
    }

    #[test]
    fn test_round_robin_wraps() {
        let mut picker = PiecePicker::new(3, PieceSelection::RoundRobin);
        let all = Bitfield::repeat(true, 3);
        picker.register_peer_pieces(&all);

        assert_eq!(picker.pick_piece(&all), Some(0));
        assert_eq!(picker.pick_piece(&all), Some(1));
        // 0 and 1 resolve, 2 is pending after this
        assert_eq!(picker.pick_piece(&all), Some(2));
        picker.reset_piece(0);
        // the cursor wraps around to 0
        assert_eq!(picker.pick_piece(&all), Some(0));
    }

    #[test]
    fn test_pick_specific() {
        let mut picker = PiecePicker::new(3, PieceSelection::RarestFirst);
        picker.register_peer_pieces(&Bitfield::repeat(true, 3));

        assert!(picker.pick_specific(1));
        // now pending, a second targeted pick is refused
        assert!(!picker.pick_specific(1));

        picker.set_priority(2, PiecePriority::DoNotDownload);
        assert!(!picker.pick_specific(2));

        picker.received_piece(0);
        assert!(!picker.pick_specific(0));
    }

    #[test]
    fn test_resume_with_own_pieces() {
        let own = bitfield_with(&[0, 1, 3]);
        let mut picker =
            PiecePicker::with_own_pieces(own, PieceSelection::RarestFirst);
        let all = full_bitfield();
        picker.register_peer_pieces(&all);

        assert_eq!(picker.wanted_remaining_count(), PIECE_COUNT - 3);
        // only missing pieces are ever picked
        let mut picked = Vec::new();
        while let Some(index) = picker.pick_piece(&all) {
            picked.push(index);
        }
        assert_eq!(picked, vec![2, 4, 5, 6, 7]);
    }
}
