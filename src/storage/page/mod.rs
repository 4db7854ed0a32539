mod page;

pub use page::{new_page_ptr, Page, PagePtr, PageReadGuard, PageWriteGuard};
