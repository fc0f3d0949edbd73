use std::fmt;

/// Opaque label marking a position in an instruction stream
///
/// Labels are only meaningful relative to the method that generated them.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(u32);

impl Label {
    /// Get the next fresh label
    pub fn next(&self) -> Label {
        Label(self.0 + 1)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Generates new labels
///
/// Cloning does not split the generator source - the cloned generator will produce the same
/// sequence of labels as the original.
#[derive(Clone, Debug, Default)]
pub struct LabelGenerator(u32);

impl LabelGenerator {
    pub fn new() -> LabelGenerator {
        LabelGenerator(0)
    }

    /// Generate a fresh label
    pub fn fresh_label(&mut self) -> Label {
        let to_return = Label(self.0);
        self.0 += 1;
        to_return
    }

    /// Ensure that no label up to and including `label` is ever generated
    pub fn reserve_through(&mut self, label: Label) {
        self.0 = self.0.max(label.0 + 1);
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}
