mod conversation;
mod errors;
mod loader;
mod tokenizer;
mod traits;

pub use conversation::{ConversationDataset, ConversationRecord, DatasetMode, ValidationFrame};
pub use errors::DataError;
pub use loader::DataLoader;
pub use tokenizer::ByteTokenizer;
pub use traits::SupervisedDataset;
