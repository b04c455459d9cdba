pub mod browser;
pub mod cdp_page;
pub mod chats;
pub mod completion;
pub mod extract;
pub mod page;
pub mod readiness;
pub mod scripts;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use browser::BrowserTransport;
pub use cdp_page::CdpPage;
pub use completion::CompletionDetector;
pub use page::{AcquireError, PageError, PageOps, PageSource};
pub use transport::{ChatManager, Transport};
