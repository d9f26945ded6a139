pub mod inference_client;
pub mod lexicon;

pub use inference_client::InferenceApiBackend;
pub use lexicon::LexiconBackend;
