use super::DecoderResult;

/// Most lines a cursor tracks
const MAX_LINES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Either,
}

/// A constraint on one bound line, identified by its role index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Level(usize, Level),
    Edge(usize, Edge),
}

/// Line levels at one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pins {
    pub sample: usize,
    levels: u16,
    bound: u16,
}

impl Pins {
    /// Level of the line at `role`, `None` when unbound
    pub fn level(&self, role: usize) -> Option<u8> {
        (role < MAX_LINES && self.bound & (1 << role) != 0)
            .then(|| u8::from(self.levels & (1 << role) != 0))
    }

    /// Level of the line at `role`, unbound lines read low
    pub fn bit(&self, role: usize) -> u8 {
        self.level(role).unwrap_or(0)
    }
}

/// Forward-only position over a set of bound lines, with the annotations
/// emitted so far.
///
/// The usable length is the shortest bound line.
pub struct SampleCursor<'a> {
    lines: Vec<Option<&'a [u8]>>,
    len: usize,
    /// Next sample `wait` will examine
    next: usize,
    results: Vec<DecoderResult>,
}

impl<'a> SampleCursor<'a> {
    pub fn new(mut lines: Vec<Option<&'a [u8]>>) -> Self {
        lines.truncate(MAX_LINES);
        let len = lines.iter().flatten().map(|l| l.len()).min().unwrap_or(0);
        Self {
            lines,
            len,
            next: 0,
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_bound(&self, role: usize) -> bool {
        matches!(self.lines.get(role), Some(Some(_)))
    }

    fn value(&self, role: usize, sample: usize) -> Option<bool> {
        match self.lines.get(role) {
            Some(Some(line)) => Some(line[sample] != 0),
            _ => None,
        }
    }

    fn holds(&self, condition: &Condition, sample: usize) -> bool {
        match *condition {
            Condition::Level(role, level) => {
                self.value(role, sample) == Some(level == Level::High)
            }
            Condition::Edge(role, edge) => {
                if sample == 0 {
                    return false;
                }
                match (self.value(role, sample - 1), self.value(role, sample)) {
                    (Some(before), Some(now)) if before != now => match edge {
                        Edge::Rising => now,
                        Edge::Falling => !now,
                        Edge::Either => true,
                    },
                    _ => false,
                }
            }
        }
    }

    fn pins(&self, sample: usize) -> Pins {
        let mut pins = Pins {
            sample,
            levels: 0,
            bound: 0,
        };
        for (role, line) in self.lines.iter().enumerate() {
            if let Some(line) = line {
                pins.bound |= 1 << role;
                if line[sample] != 0 {
                    pins.levels |= 1 << role;
                }
            }
        }
        pins
    }

    /// Advance to the next sample where every condition holds.
    ///
    /// An empty condition list matches the next sample. Returns `None` once
    /// the data is exhausted.
    pub fn wait(&mut self, conditions: &[Condition]) -> Option<Pins> {
        self.wait_any(&[conditions]).map(|(_, pins)| pins)
    }

    /// Advance to the next sample where any of the condition sets holds.
    ///
    /// Returns the index of the first matching set.
    pub fn wait_any(&mut self, sets: &[&[Condition]]) -> Option<(usize, Pins)> {
        while self.next < self.len {
            let sample = self.next;
            self.next += 1;
            let matched = sets
                .iter()
                .position(|set| set.iter().all(|c| self.holds(c, sample)));
            if let Some(set) = matched {
                return Some((set, self.pins(sample)));
            }
        }
        None
    }

    /// Whether every condition holds at `sample`, without moving the cursor
    pub fn holds_at(&self, sample: usize, conditions: &[Condition]) -> bool {
        sample < self.len && conditions.iter().all(|c| self.holds(c, sample))
    }

    /// Jump to `sample` without checking conditions
    pub fn skip_to(&mut self, sample: usize) -> Option<Pins> {
        if sample >= self.len {
            self.next = self.len;
            return None;
        }
        self.next = sample + 1;
        Some(self.pins(sample))
    }

    /// Emit an annotation. `end_sample` is raised to `start_sample` if lower.
    pub fn put(
        &mut self,
        start_sample: usize,
        end_sample: usize,
        annotation_type: usize,
        values: Vec<String>,
    ) {
        self.results.push(DecoderResult {
            start_sample,
            end_sample: end_sample.max(start_sample),
            annotation_type,
            values,
        });
    }

    pub fn into_results(self) -> Vec<DecoderResult> {
        self.results
    }
}
