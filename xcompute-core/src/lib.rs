/*!
Device independent parts of xcompute.

- [`function`]: portable kernel signatures.
- [`container`]: the `SPVC` container bundling several precompiled modules.
- [`work_group`]: negotiation of a requested local work size against device limits.
*/

pub mod container;
pub mod function;
pub mod work_group;
