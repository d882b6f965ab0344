//! Six-way relation between a new write and a record's logged span.
//!
//! Both spans are half-open and relative to the granule base. `req` is the
//! incoming sub-write, `log` the span the record already holds.
//!
//! ```text
//!  Before       req |---|                 |=====| log
//!  HeadOverlap      |-------|==========|
//!  Covers           |--------------------|          (log inside req)
//!  Inside                 |=|--|=====|             (req inside log)
//!  TailOverlap            |=======|--------|
//!  After              |=====|            |----|
//! ```

use std::ops::Range;

/// How a request span sits relative to a logged span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Request ends before the logged span starts (disjoint).
    Before = 1,
    /// Request starts at or before the log and ends inside it.
    HeadOverlap = 2,
    /// Request starts at or before the log and ends at or after its end.
    Covers = 3,
    /// Request lies strictly after the log start and ends inside it.
    Inside = 4,
    /// Request starts inside the log (or right at its end) and runs past it.
    TailOverlap = 5,
    /// Request starts after the logged span ends (disjoint).
    After = 6,
}

/// Where one piece of a spliced read comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Copy from the mapped image.
    Image(Range<usize>),
    /// Copy from the record's log buffer.
    Log(Range<usize>),
}

impl Overlap {
    /// Classify `req` against `log`. Total over non-empty spans.
    pub fn classify(req: &Range<usize>, log: &Range<usize>) -> Overlap {
        if req.start <= log.start {
            if req.end >= log.start {
                if req.end < log.end {
                    Overlap::HeadOverlap
                } else {
                    Overlap::Covers
                }
            } else {
                Overlap::Before
            }
        } else if req.end <= log.end {
            Overlap::Inside
        } else if log.end < req.start {
            Overlap::After
        } else {
            Overlap::TailOverlap
        }
    }

    /// Case number in the 1..=6 numbering used by traces.
    pub fn case(self) -> u8 {
        self as u8
    }

    /// Span the record holds after logging `req` on top of `log`, and the
    /// gap between them that must be backfilled from the image.
    pub fn merge(self, req: &Range<usize>, log: &Range<usize>) -> (Range<usize>, Option<Range<usize>>) {
        match self {
            Overlap::Before => (req.start..log.end, Some(req.end..log.start)),
            Overlap::HeadOverlap => (req.start..log.end, None),
            Overlap::Covers => (req.clone(), None),
            Overlap::Inside => (log.clone(), None),
            Overlap::TailOverlap => (log.start..req.end, None),
            Overlap::After => (log.start..req.end, Some(log.end..req.start)),
        }
    }

    /// Sources for reading `req` when `log` holds the newest bytes of its span.
    pub fn splice(self, req: &Range<usize>, log: &Range<usize>) -> impl Iterator<Item = Piece> {
        let pieces: [Option<Piece>; 3] = match self {
            Overlap::Before | Overlap::After => [Some(Piece::Image(req.clone())), None, None],
            Overlap::HeadOverlap => [
                Some(Piece::Image(req.start..log.start)),
                Some(Piece::Log(log.start..req.end)),
                None,
            ],
            Overlap::Covers => [
                Some(Piece::Image(req.start..log.start)),
                Some(Piece::Log(log.clone())),
                Some(Piece::Image(log.end..req.end)),
            ],
            Overlap::Inside => [Some(Piece::Log(req.clone())), None, None],
            Overlap::TailOverlap => [
                Some(Piece::Log(req.start..log.end)),
                Some(Piece::Image(log.end..req.end)),
                None,
            ],
        };
        pieces.into_iter().flatten().filter(|p| match p {
            Piece::Image(r) | Piece::Log(r) => !r.is_empty(),
        })
    }

    /// Parts of `req` not already covered by `log`.
    pub fn uncovered(self, req: &Range<usize>, log: &Range<usize>) -> [Option<Range<usize>>; 2] {
        let head = req.start..req.end.min(log.start);
        let tail = req.start.max(log.end)..req.end;
        match self {
            Overlap::Before | Overlap::After => [Some(req.clone()), None],
            Overlap::Inside => [None, None],
            _ => [
                Some(head).filter(|r| !r.is_empty()),
                Some(tail).filter(|r| !r.is_empty()),
            ],
        }
    }
}
