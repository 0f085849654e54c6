/// Maps text to UTF-8 bytes, with two extra ids for padding and end of sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 258;
    pub const PAD: u32 = 256;
    pub const EOS: u32 = 257;

    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    /// Decodes up to the first EOS, skipping padding.
    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .take_while(|id| **id != Self::EOS)
            .filter_map(|id| u8::try_from(*id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
