//! # modmerge-engine
//!
//! Structural merging of game script and XML files.
//!
//! ## Approach
//!
//! 1. **Parsing** builds a tree of signature-addressed nodes. A signature
//!    names a construct (`sub:main`, `variable:int:x`, `funCall:f:1`) and does
//!    not change when whitespace or comments do. XML documents map onto the
//!    same nodes, one per element (`element:skill:Jump`).
//!
//! 2. **Comparison** walks two trees in step, matching children by
//!    signature, and reports each construct that one side changed or dropped
//!    as a conflict. Constructs only the mod has are additions and merge
//!    without asking.
//!
//! 3. **Materialization** rewrites the base text span by span according to
//!    each conflict's resolution, so untouched regions keep their formatting.
//!
//! ## Example
//!
//! ```rust
//! use modmerge_engine::{diff, materialize, parse, SourceNames, UserChoice};
//!
//! let base = parse("sub main() { speed(1.0); }").unwrap();
//! let modded = parse("sub main() { speed(2.0); jump(); }").unwrap();
//!
//! let mut result = diff(&base, &modded, &SourceNames::default());
//! for record in &mut result.conflicts {
//!     record.resolution = Some(UserChoice::MergeMod);
//! }
//! let merged = materialize(&base, &result).unwrap();
//! assert_eq!(merged, "sub main() { speed(2.0); jump(); }");
//! ```

pub mod comparator;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod types;
pub mod xml;

pub use comparator::{
    Addition, ChangeStatus, ConflictRecord, ConflictType, ResolutionSession, SourceNames,
    TreeDiff, UserChoice, apply_resolution, compare, diff,
};
pub use parser::{ParseError, Syntax, parse};
pub use resolver::{MergeError, materialize};
pub use types::{ChildMap, NodeKind, ScriptNode, ScriptTree};
pub use xml::parse_xml;
