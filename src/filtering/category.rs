//! Rule categories and engine-wide option toggles
//!
//! Categories are small integer tags naming the list a rule came from. The
//! host enables/disables them at runtime; the pipeline snapshots the enabled
//! set once per connection.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Category tag attached to every loaded rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(pub u8);

impl Category {
    pub fn id(self) -> u8 {
        self.0
    }
}

impl From<u8> for Category {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "category {}", self.0)
    }
}

/// Set of categories, one bit per possible category id
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryMask([u64; 4]);

impl CategoryMask {
    /// Mask with no category set
    pub const fn empty() -> Self {
        Self([0; 4])
    }

    /// Mask with every category set
    pub const fn all() -> Self {
        Self([u64::MAX; 4])
    }

    /// Mask containing exactly one category
    pub fn only(category: Category) -> Self {
        let mut mask = Self::empty();
        mask.insert(category);
        mask
    }

    pub fn insert(&mut self, category: Category) {
        let (word, bit) = Self::slot(category);
        self.0[word] |= bit;
    }

    pub fn remove(&mut self, category: Category) {
        let (word, bit) = Self::slot(category);
        self.0[word] &= !bit;
    }

    pub fn contains(&self, category: Category) -> bool {
        let (word, bit) = Self::slot(category);
        self.0[word] & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Iterate set categories in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
        (0..=u8::MAX)
            .map(Category)
            .filter(move |c| self.contains(*c))
    }

    fn slot(category: Category) -> (usize, u64) {
        let id = category.0 as usize;
        (id / 64, 1u64 << (id % 64))
    }
}

impl FromIterator<Category> for CategoryMask {
    fn from_iter<I: IntoIterator<Item = Category>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for category in iter {
            mask.insert(category);
        }
        mask
    }
}

impl fmt::Debug for CategoryMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.0)).finish()
    }
}

/// Engine-wide boolean options
///
/// The numeric ids are only used at the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOption {
    /// Decrypt TLS traffic; when off, CONNECT tunnels are relayed raw
    InterceptTls,
    /// Remove elements matched by cosmetic rules from HTML documents
    ElementHiding,
    /// Block HTML documents whose text contains a content trigger
    ScanContentTriggers,
    /// Tunnel raw bytes when interception cannot be set up for a CONNECT target
    TunnelOnInterceptFailure,
}

impl EngineOption {
    pub const ALL: [EngineOption; 4] = [
        EngineOption::InterceptTls,
        EngineOption::ElementHiding,
        EngineOption::ScanContentTriggers,
        EngineOption::TunnelOnInterceptFailure,
    ];

    pub fn id(self) -> u32 {
        match self {
            EngineOption::InterceptTls => 0,
            EngineOption::ElementHiding => 1,
            EngineOption::ScanContentTriggers => 2,
            EngineOption::TunnelOnInterceptFailure => 3,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.id() == id)
    }

    fn bit(self) -> u32 {
        1 << self.id()
    }
}

/// Snapshot of enabled options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionSet(u32);

impl OptionSet {
    pub fn contains(&self, option: EngineOption) -> bool {
        self.0 & option.bit() != 0
    }

    pub fn with(mut self, option: EngineOption) -> Self {
        self.0 |= option.bit();
        self
    }

    pub fn without(mut self, option: EngineOption) -> Self {
        self.0 &= !option.bit();
        self
    }
}

impl FromIterator<EngineOption> for OptionSet {
    fn from_iter<I: IntoIterator<Item = EngineOption>>(iter: I) -> Self {
        iter.into_iter().fold(OptionSet::default(), OptionSet::with)
    }
}

/// Live, shared option and category bits
///
/// Writers use atomic read-modify-write; readers take a snapshot when a
/// connection is accepted.
#[derive(Debug)]
pub struct EngineToggles {
    options: AtomicU32,
    categories: [AtomicU64; 4],
}

impl EngineToggles {
    pub fn new(options: OptionSet) -> Self {
        Self {
            options: AtomicU32::new(options.0),
            categories: Default::default(),
        }
    }

    pub fn option_enabled(&self, option: EngineOption) -> bool {
        self.options.load(Ordering::Acquire) & option.bit() != 0
    }

    pub fn set_option_enabled(&self, option: EngineOption, enabled: bool) {
        if enabled {
            self.options.fetch_or(option.bit(), Ordering::AcqRel);
        } else {
            self.options.fetch_and(!option.bit(), Ordering::AcqRel);
        }
    }

    pub fn category_enabled(&self, category: Category) -> bool {
        let (word, bit) = CategoryMask::slot(category);
        self.categories[word].load(Ordering::Acquire) & bit != 0
    }

    pub fn set_category_enabled(&self, category: Category, enabled: bool) {
        let (word, bit) = CategoryMask::slot(category);
        if enabled {
            self.categories[word].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.categories[word].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn options(&self) -> OptionSet {
        OptionSet(self.options.load(Ordering::Acquire))
    }

    pub fn categories(&self) -> CategoryMask {
        let mut words = [0u64; 4];
        for (slot, word) in words.iter_mut().zip(self.categories.iter()) {
            *slot = word.load(Ordering::Acquire);
        }
        CategoryMask(words)
    }
}

impl Default for EngineToggles {
    fn default() -> Self {
        Self::new(
            [EngineOption::InterceptTls, EngineOption::ElementHiding]
                .into_iter()
                .collect(),
        )
    }
}
