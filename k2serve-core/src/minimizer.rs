//! Minimizer extraction over nucleotide and protein sequences.
//!
//! The scanner yields exactly one minimizer per k-mer window: the
//! smallest canonical l-mer inside the window, after applying the spaced
//! seed mask and XOR-toggling for ordering. Windows containing a
//! non-alphabet character are flagged ambiguous instead.

use std::collections::VecDeque;

use crate::index::IndexOptions;

/// XOR mask applied to candidate l-mers before comparison so that runs of
/// low-complexity sequence do not all collapse onto the same minimizer.
pub const DEFAULT_TOGGLE_MASK: u64 = 0xe37e_28c4_271b_5a2d;

/// Current reverse-complement canonicalization scheme. Version 0 is kept
/// only to read databases built before the realignment fix.
pub const CURRENT_REVCOM_VERSION: u32 = 1;

const BITS_PER_CHAR_DNA: usize = 2;
const BITS_PER_CHAR_PRO: usize = 4;

/// Streaming minimizer scanner with reusable internal buffers.
///
/// A scanner is built once per worker from the index parameters and fed
/// one sequence at a time via [`load_sequence`](Self::load_sequence).
pub struct MinimizerScanner {
    k: usize,
    l: usize,
    spaced_seed_mask: u64,
    dna: bool,
    toggle_mask: u64,
    revcom_version: u32,
    lmer_mask: u64,

    seq: Vec<u8>,
    /// Next character position to consume.
    pos: usize,
    lmer: u64,
    /// Count of consecutive valid characters loaded into `lmer`, capped at `l`.
    loaded: usize,
    /// Most recent position holding a non-alphabet character.
    last_invalid: Option<usize>,
    /// Monotonic queue of `(candidate, lmer_index)`, minimum at the front.
    window: VecDeque<(u64, usize)>,
    ambiguous: bool,
}

impl MinimizerScanner {
    /// # Panics
    ///
    /// Panics if `l > k` or if `l` does not fit the 64-bit packing for
    /// the chosen alphabet (31 for DNA, 15 for protein).
    #[must_use]
    pub fn new(
        k: usize,
        l: usize,
        spaced_seed_mask: u64,
        dna: bool,
        toggle_mask: u64,
        revcom_version: u32,
    ) -> Self {
        let bits = if dna { BITS_PER_CHAR_DNA } else { BITS_PER_CHAR_PRO };
        assert!(l <= k, "minimizer length {l} exceeds k-mer length {k}");
        assert!(
            l * bits < 64,
            "minimizer length {l} too long for 64-bit packing"
        );
        let lmer_mask = (1u64 << (l * bits)) - 1;
        Self {
            k,
            l,
            spaced_seed_mask,
            dna,
            toggle_mask: toggle_mask & lmer_mask,
            revcom_version,
            lmer_mask,
            seq: Vec::new(),
            pos: 0,
            lmer: 0,
            loaded: 0,
            last_invalid: None,
            window: VecDeque::new(),
            ambiguous: false,
        }
    }

    /// Scanner configured from the parameters of a loaded database.
    #[must_use]
    pub fn from_options(options: &IndexOptions) -> Self {
        Self::new(
            options.k,
            options.l,
            options.spaced_seed_mask,
            options.dna_db,
            options.toggle_mask,
            options.revcom_version,
        )
    }

    /// Begin scanning a new sequence, reusing internal buffers.
    pub fn load_sequence(&mut self, seq: &str) {
        self.seq.clear();
        self.seq.extend_from_slice(seq.as_bytes());
        self.pos = 0;
        self.lmer = 0;
        self.loaded = 0;
        self.last_invalid = None;
        self.window.clear();
        self.ambiguous = false;
    }

    /// Whether the k-mer returned by the last call to
    /// [`next_minimizer`](Self::next_minimizer) contained a non-alphabet
    /// character.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        self.ambiguous
    }

    /// Advance by one k-mer window and return its minimizer.
    ///
    /// Returns `None` once the sequence is exhausted; a sequence shorter
    /// than `k` yields nothing. For ambiguous windows the returned value
    /// is meaningless and [`is_ambiguous`](Self::is_ambiguous) is set.
    pub fn next_minimizer(&mut self) -> Option<u64> {
        let window_end = if self.pos == 0 { self.k } else { self.pos + 1 };
        if window_end > self.seq.len() {
            return None;
        }
        for i in self.pos..window_end {
            self.consume(i);
        }
        self.pos = window_end;
        let window_start = self.pos - self.k;

        while let Some(&(_, idx)) = self.window.front() {
            if idx < window_start {
                self.window.pop_front();
            } else {
                break;
            }
        }

        self.ambiguous = self
            .last_invalid
            .is_some_and(|invalid| invalid >= window_start);
        if self.ambiguous {
            return Some(0);
        }

        match self.window.front() {
            Some(&(candidate, _)) => Some(candidate ^ self.toggle_mask),
            None => {
                debug_assert!(false, "empty window for unambiguous k-mer");
                self.ambiguous = true;
                Some(0)
            }
        }
    }

    fn consume(&mut self, i: usize) {
        let bits = if self.dna {
            BITS_PER_CHAR_DNA
        } else {
            BITS_PER_CHAR_PRO
        };
        match self.char_code(self.seq[i]) {
            Some(code) => {
                self.lmer = ((self.lmer << bits) | code) & self.lmer_mask;
                if self.loaded < self.l {
                    self.loaded += 1;
                }
                if self.loaded == self.l {
                    let canonical = if self.dna {
                        self.lmer.min(self.reverse_complement(self.lmer))
                    } else {
                        self.lmer
                    };
                    let masked = if self.spaced_seed_mask != 0 {
                        canonical & self.spaced_seed_mask
                    } else {
                        canonical
                    };
                    let candidate = masked ^ self.toggle_mask;
                    let idx = i + 1 - self.l;
                    while self
                        .window
                        .back()
                        .is_some_and(|&(back, _)| back > candidate)
                    {
                        self.window.pop_back();
                    }
                    self.window.push_back((candidate, idx));
                }
            }
            None => {
                self.last_invalid = Some(i);
                self.lmer = 0;
                self.loaded = 0;
                // No l-mer spanning this position will ever be generated,
                // and earlier entries cannot serve any later valid window.
                self.window.clear();
            }
        }
    }

    fn char_code(&self, ch: u8) -> Option<u64> {
        if self.dna {
            match ch {
                b'A' | b'a' => Some(0),
                b'C' | b'c' => Some(1),
                b'G' | b'g' => Some(2),
                b'T' | b't' => Some(3),
                _ => None,
            }
        } else {
            // Reduced 16-letter protein alphabet along BLOSUM62 clusters.
            match ch.to_ascii_uppercase() {
                b'*' | b'U' | b'O' => Some(0),
                b'A' => Some(1),
                b'N' | b'Q' | b'S' => Some(2),
                b'C' => Some(3),
                b'D' | b'E' => Some(4),
                b'F' => Some(5),
                b'G' => Some(6),
                b'H' => Some(7),
                b'I' | b'L' => Some(8),
                b'K' | b'R' => Some(9),
                b'M' => Some(10),
                b'P' => Some(11),
                b'T' => Some(12),
                b'V' => Some(13),
                b'W' => Some(14),
                b'Y' => Some(15),
                _ => None,
            }
        }
    }

    /// Reverse complement of a packed l-mer.
    fn reverse_complement(&self, lmer: u64) -> u64 {
        // Reverse the 2-bit groups (bit pairs stay intact).
        let mut x = lmer;
        x = ((x >> 2) & 0x3333_3333_3333_3333) | ((x & 0x3333_3333_3333_3333) << 2);
        x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F) | ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4);
        x = x.swap_bytes();
        if self.revcom_version == 0 {
            // Historical scheme: complement without realigning; wrong end
            // of the word, kept for compatibility with old databases.
            !x & self.lmer_mask
        } else {
            (!x >> (64 - self.l * BITS_PER_CHAR_DNA)) & self.lmer_mask
        }
    }
}
