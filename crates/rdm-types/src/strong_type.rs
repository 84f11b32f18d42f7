/// Declares an opaque handle newtype over an integer.
///
/// Handles display with a short prefix (`ch7`, `qp3`) so log lines stay
/// compact, and debug-print with the type name. The inner value is public
/// for the device layer, which allocates the numbers.
#[macro_export]
macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Raw numeric value.
            #[inline]
            pub fn raw(self) -> $inner {
                self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    handle_type!(TestHandle, u64, "t");

    #[test]
    fn test_handle_display_debug() {
        let h = TestHandle(7);
        assert_eq!(format!("{}", h), "t7");
        assert_eq!(format!("{:?}", h), "TestHandle(7)");
        assert_eq!(h.raw(), 7);
    }

    #[test]
    fn test_handle_from_and_order() {
        let a: TestHandle = 1u64.into();
        let b = TestHandle(2);
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_hash() {
        let set: HashSet<_> = [TestHandle(1), TestHandle(2), TestHandle(1)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_handle_serde_transparent() {
        let json = serde_json::to_string(&TestHandle(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: TestHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TestHandle(42));
    }
}
