//! Index and identity newtypes.
//!
//! Function and global indices address the module's static index spaces.
//! Instance, debugger and handler ids identify the parties that own a
//! breakpoint; the embedder chooses their values.

use std::fmt;

macro_rules! index_newtype {
    ($(#[$meta:meta])* $name:ident($repr:ty), $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $repr);

        impl $name
        {
            /// Raw numeric value.
            #[must_use]
            pub const fn raw(self) -> $repr
            {
                self.0
            }
        }

        impl From<$repr> for $name
        {
            fn from(value: $repr) -> Self
            {
                $name(value)
            }
        }

        impl From<$name> for $repr
        {
            fn from(value: $name) -> Self
            {
                value.0
            }
        }

        impl fmt::Display for $name
        {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
            {
                write!(f, concat!($label, "{}"), self.0)
            }
        }
    };
}

index_newtype!(
    /// Index into the module's function index space (imports first).
    FuncIndex(u32),
    "func#"
);

impl FuncIndex
{
    /// Index as a `usize`, for indexing per-function tables.
    #[must_use]
    pub const fn as_usize(self) -> usize
    {
        self.0 as usize
    }
}

index_newtype!(
    /// Index into the module's global index space.
    GlobalIndex(u32),
    "global#"
);

impl GlobalIndex
{
    /// Index as a `usize`, for indexing per-global tables.
    #[must_use]
    pub const fn as_usize(self) -> usize
    {
        self.0 as usize
    }
}

index_newtype!(
    /// Identity of a live instance.
    InstanceId(u64),
    "instance#"
);

index_newtype!(
    /// Identity of an attached external debugger.
    DebuggerId(u64),
    "debugger#"
);

index_newtype!(
    /// Identity of a breakpoint handler registered by a debugger.
    HandlerId(u64),
    "handler#"
);
