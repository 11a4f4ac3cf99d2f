mod page;
mod pager;

pub use page::Page;
pub use pager::{Pager, PagerConfig};
