pub mod aligner;
pub mod buffer;
pub mod provider;
pub mod trigger;

pub use buffer::{SynthesisChunkBuffer, SynthesisConfig, SynthesisSession};
pub use provider::{MockReply, MockSynthesisProvider, SynthesisProvider, ToneSynthesizer};
