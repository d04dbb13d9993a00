pub mod attention;
pub mod causal_lm;
pub mod ffn;
pub mod kv_cache;
pub mod layer;
pub mod linear;
pub mod logits_head;
pub mod moe;
pub mod rope_table;

pub use causal_lm::{CausalLm, ModelLora};
pub use kv_cache::KvCache;
pub use layer::{Layer, LayerLora};
pub use linear::{Linear, LoraDelta};
pub use logits_head::LogitsHead;
pub use rope_table::RopeTable;
