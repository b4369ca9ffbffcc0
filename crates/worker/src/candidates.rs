//! Candidate space enumeration.
//!
//! Candidates are produced shortest first and, within one length, in the
//! lexicographic product order of the charset (the order of the charset
//! as given, not code point order).

/// Number of candidates of length `1..=max_length` over `charset_len` symbols.
pub fn search_space_size(charset_len: usize, max_length: u8) -> u128 {
    let base = charset_len as u128;
    (1..=u32::from(max_length)).map(|len| base.pow(len)).sum()
}

/// Iterator over every candidate of length 1 through `max_length`.
pub struct CandidateSpace<'a> {
    charset: &'a [char],
    max_length: usize,
    /// Odometer of charset indices for the next candidate.
    indices: Vec<usize>,
    exhausted: bool,
}

impl<'a> CandidateSpace<'a> {
    pub fn new(charset: &'a [char], max_length: u8) -> Self {
        Self {
            charset,
            max_length: usize::from(max_length),
            indices: vec![0],
            exhausted: charset.is_empty() || max_length == 0,
        }
    }

    /// Advance the odometer; roll over into the next length when the
    /// current one is used up.
    fn advance(&mut self) {
        let base = self.charset.len();
        for pos in (0..self.indices.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < base {
                return;
            }
            self.indices[pos] = 0;
        }

        if self.indices.len() == self.max_length {
            self.exhausted = true;
        } else {
            self.indices.push(0);
        }
    }
}

impl Iterator for CandidateSpace<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.exhausted {
            return None;
        }
        let candidate = self.indices.iter().map(|&i| self.charset[i]).collect();
        self.advance();
        Some(candidate)
    }
}
