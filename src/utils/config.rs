use core::cmp;
use core::fmt;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Returns the smallest permitted value.
    pub fn min(self) -> T {
        self.min
    }

    /// Returns the largest permitted value.
    pub fn max(self) -> T {
        self.max
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }

    /// Returns whether the value is inside the permitted range.
    pub fn contains(self, value: &T) -> bool
    where
        T: Ord,
    {
        *value >= self.min && *value <= self.max
    }
}

//--- Debug

impl<T: fmt::Debug> fmt::Debug for DefMinMax<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefMinMax")
            .field("def", &self.def)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

//============ Testing =======================================================
