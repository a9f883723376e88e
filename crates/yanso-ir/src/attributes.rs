//! Function and Parameter Attributes

use smallvec::SmallVec;

/// Function-level attributes the passes care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnAttr {
    NoInline,
    AlwaysInline,
    OptimizeNone,
    NoReturn,
}

/// A small ordered set of function attributes.
#[derive(Debug, Clone, Default)]
pub struct AttributeSet {
    attrs: SmallVec<[FnAttr; 2]>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, attr: FnAttr) {
        if !self.has(attr) {
            self.attrs.push(attr);
        }
    }

    pub fn remove(&mut self, attr: FnAttr) {
        self.attrs.retain(|a| *a != attr);
    }

    pub fn has(&self, attr: FnAttr) -> bool {
        self.attrs.contains(&attr)
    }

    pub fn iter(&self) -> impl Iterator<Item = FnAttr> + '_ {
        self.attrs.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_set() {
        let mut set = AttributeSet::new();
        assert!(!set.has(FnAttr::NoInline));
        set.add(FnAttr::NoInline);
        set.add(FnAttr::NoInline);
        set.add(FnAttr::OptimizeNone);
        assert!(set.has(FnAttr::NoInline));
        assert_eq!(set.iter().count(), 2);
        set.remove(FnAttr::NoInline);
        assert!(!set.has(FnAttr::NoInline));
    }
}
