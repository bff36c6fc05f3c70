//! Model configuration and the closed set of architecture variants.
//!
//! Configuration is read from JSON with flat keys, then every name is parsed
//! into an enum and the whole config is validated once, before any weights
//! exist. A model is never constructed from a config that failed
//! [`ModelConfig::validate`].

#![allow(clippy::doc_markdown)]

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::shard::ShardTopology;
use crate::{Error, Result};

// ---- Architecture variants ----

/// Named architecture variants.
///
/// Each variant fixes the layer composition, bias placement and weight
/// layout through [`Architecture::spec`]; nothing else in the crate branches
/// on boolean compatibility flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    GptJ,
    GptNeo,
    NeoX,
    NeoXSequential,
    FairseqLm,
    Opt,
    OptPostNorm,
    Bloom,
}

/// How attention and feedforward feed the residual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residual {
    /// Both branches read the layer input and are summed into the residual.
    /// `shared_norm` means both read the same normalized tensor.
    Parallel { shared_norm: bool },
    /// Feedforward reads the residual after attention was added.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormPlacement {
    /// Normalize the sub-block input.
    Pre,
    /// Normalize after the residual add.
    Post,
}

/// Layout of the query/key/value projection weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// Three `(d_model, d_model)` matrices.
    Separate,
    /// One `(d_model, 3 * d_model)` matrix, head-major with `[q | k | v]`
    /// inside every head.
    Combined,
}

/// Where the `1/sqrt(d_head)` attention scale is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogitScaling {
    /// Divide `q·k` by `sqrt(d_head)`.
    Scaled,
    /// Multiply `q` by `1/sqrt(d_head)` right after its projection.
    PrescaledQuery,
    /// No scaling at all.
    Unscaled,
}

/// Output head layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// Separate `(d_model, vocab)` projection, optionally with a bias.
    Untied { bias: bool },
    /// Reuses the embedding table, transposed.
    Tied,
}

/// Everything an [`Architecture`] fixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchitectureSpec {
    pub residual: Residual,
    pub norm_placement: NormPlacement,
    pub qkv_layout: QkvLayout,
    pub qkv_bias: bool,
    pub out_bias: bool,
    pub logit_scaling: LogitScaling,
    pub rotary_layout: RotaryLayout,
    pub rotary_offset: usize,
    pub activation: Activation,
    pub collective: CollectivePoint,
    pub head: HeadKind,
    pub embedding_bias: bool,
    pub embedding_scale: bool,
    pub embedding_norm: bool,
    pub final_norm: bool,
    /// Odd layers use local (windowed) attention.
    pub alternating_local: bool,
}

impl Architecture {
    /// All variants, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::GptJ,
        Self::GptNeo,
        Self::NeoX,
        Self::NeoXSequential,
        Self::FairseqLm,
        Self::Opt,
        Self::OptPostNorm,
        Self::Bloom,
    ];

    /// The fixed composition table for this variant.
    #[must_use]
    pub const fn spec(self) -> ArchitectureSpec {
        let base = ArchitectureSpec {
            residual: Residual::Sequential,
            norm_placement: NormPlacement::Pre,
            qkv_layout: QkvLayout::Separate,
            qkv_bias: true,
            out_bias: true,
            logit_scaling: LogitScaling::Scaled,
            rotary_layout: RotaryLayout::Interleaved,
            rotary_offset: 0,
            activation: Activation::GeluFast,
            collective: CollectivePoint::Late,
            head: HeadKind::Tied,
            embedding_bias: false,
            embedding_scale: false,
            embedding_norm: false,
            final_norm: true,
            alternating_local: false,
        };
        match self {
            Self::GptJ => ArchitectureSpec {
                residual: Residual::Parallel { shared_norm: true },
                qkv_bias: false,
                out_bias: false,
                activation: Activation::GeluTanh,
                head: HeadKind::Untied { bias: true },
                embedding_bias: true,
                ..base
            },
            Self::GptNeo => ArchitectureSpec {
                qkv_bias: false,
                logit_scaling: LogitScaling::Unscaled,
                activation: Activation::GeluTanh,
                alternating_local: true,
                ..base
            },
            Self::NeoX => ArchitectureSpec {
                residual: Residual::Parallel { shared_norm: false },
                qkv_layout: QkvLayout::Combined,
                rotary_layout: RotaryLayout::Halves,
                head: HeadKind::Untied { bias: false },
                ..base
            },
            Self::NeoXSequential => ArchitectureSpec {
                qkv_layout: QkvLayout::Combined,
                rotary_layout: RotaryLayout::Halves,
                collective: CollectivePoint::Early,
                head: HeadKind::Untied { bias: false },
                ..base
            },
            Self::FairseqLm => ArchitectureSpec {
                logit_scaling: LogitScaling::PrescaledQuery,
                rotary_offset: 2,
                activation: Activation::Gelu,
                embedding_scale: true,
                ..base
            },
            Self::Opt => ArchitectureSpec {
                logit_scaling: LogitScaling::PrescaledQuery,
                activation: Activation::Relu,
                ..base
            },
            Self::OptPostNorm => ArchitectureSpec {
                norm_placement: NormPlacement::Post,
                logit_scaling: LogitScaling::PrescaledQuery,
                activation: Activation::Relu,
                final_norm: false,
                ..base
            },
            Self::Bloom => ArchitectureSpec {
                qkv_layout: QkvLayout::Combined,
                embedding_norm: true,
                ..base
            },
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GptJ => "gpt-j",
            Self::GptNeo => "gpt-neo",
            Self::NeoX => "neox",
            Self::NeoXSequential => "neox-sequential",
            Self::FairseqLm => "fairseq-lm",
            Self::Opt => "opt",
            Self::OptPostNorm => "opt-post-norm",
            Self::Bloom => "bloom",
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpt-j" | "j" => Ok(Self::GptJ),
            "gpt-neo" | "neo" => Ok(Self::GptNeo),
            "neox" => Ok(Self::NeoX),
            "neox-sequential" => Ok(Self::NeoXSequential),
            "fairseq-lm" | "fairseq_lm" => Ok(Self::FairseqLm),
            "opt" => Ok(Self::Opt),
            "opt-post-norm" => Ok(Self::OptPostNorm),
            "bloom" => Ok(Self::Bloom),
            other => Err(Error::config(format!(
                "unsupported architecture variant '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---- Normalization ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Layernorm whose parameters are gathered and taken from shard 0.
    LayerNorm,
    /// Layernorm using the shard's own copy, no collective.
    LocalLayerNorm,
    /// Layernorm that stitches two checkpoint halves after the shard count
    /// doubled.
    DoubleLayerNorm,
    /// `x / ||x||` with a per-feature scale.
    RmsNorm,
    /// `x / ||x||` with a single scalar scale.
    ScaleNorm,
}

/// A normalization kind plus whether it carries a learned offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormConfig {
    pub kind: NormKind,
    pub offset: bool,
}

impl NormConfig {
    pub const LAYERNORM: Self = Self {
        kind: NormKind::LayerNorm,
        offset: true,
    };
}

impl FromStr for NormConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, offset) = match s {
            "layernorm" => (NormKind::LayerNorm, true),
            "layernorm-nobias" => (NormKind::LayerNorm, false),
            "layernorm-desync" => (NormKind::LocalLayerNorm, true),
            "layernorm-desync-nobias" => (NormKind::LocalLayerNorm, false),
            "doublelayernorm" => (NormKind::DoubleLayerNorm, true),
            "doublelayernorm-nobias" => (NormKind::DoubleLayerNorm, false),
            "rmsnorm" => (NormKind::RmsNorm, false),
            "rmsnorm-bias" => (NormKind::RmsNorm, true),
            "scalenorm" => (NormKind::ScaleNorm, false),
            "scalenorm-bias" => (NormKind::ScaleNorm, true),
            other => {
                return Err(Error::config(format!(
                    "unsupported normalization kind '{other}'"
                )))
            }
        };
        Ok(Self { kind, offset })
    }
}

// ---- Activations ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    /// tanh-approximated GELU (`gelu_new`, `gelu_python`)
    GeluTanh,
    /// exact GELU, `0.5 x (1 + erf(x / sqrt 2))`
    Gelu,
    /// `x * sigmoid(1.702 x)`
    QuickGelu,
    /// `0.5 x (1 + tanh(0.79788456 x (1 + 0.044715 x²)))`
    GeluFast,
    /// tanh-approximated GELU clipped to `[-10, 10]`
    Gelu10,
    /// `x * tanh(softplus(x))`
    Mish,
    Silu,
    Relu,
    Sigmoid,
    Tanh,
    Linear,
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gelu_new" | "gelu_python" => Ok(Self::GeluTanh),
            "gelu" => Ok(Self::Gelu),
            "quick_gelu" => Ok(Self::QuickGelu),
            "gelu_fast" => Ok(Self::GeluFast),
            "gelu_10" => Ok(Self::Gelu10),
            "mish" => Ok(Self::Mish),
            "silu" | "swish" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "linear" | "identity" => Ok(Self::Linear),
            other => Err(Error::config(format!("unsupported activation '{other}'"))),
        }
    }
}

// ---- Positional encodings ----

/// Bit layout of the rotary prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryLayout {
    /// Dimensions `(2i, 2i+1)` form a rotated pair.
    Interleaved,
    /// Dimensions `(i, i + r/2)` form a rotated pair.
    Halves,
}

impl FromStr for RotaryLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interleaved" => Ok(Self::Interleaved),
            "halves" => Ok(Self::Halves),
            other => Err(Error::config(format!("unsupported rotary layout '{other}'"))),
        }
    }
}

/// Feature order of a sinusoidal position table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinusoidLayout {
    /// `[sin_0, cos_0, sin_1, cos_1, ..]`
    Interleaved,
    /// `[sin_0, sin_1, .., cos_0, cos_1, ..]`
    Concatenated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionalEncoding {
    Rotary {
        /// Fraction of `d_head` that is rotated.
        fraction: f32,
        /// Constant added to every position before computing angles.
        offset: usize,
        layout: RotaryLayout,
    },
    Alibi,
    RelativeBuckets {
        num_buckets: usize,
        max_distance: usize,
    },
    /// Learned `(seq, d_model)` table added to the token embedding; row
    /// `(position + shift) % seq` is used.
    Learned { shift: usize },
    /// Fixed sinusoids added to the token embedding, starting at `shift`.
    Sinusoidal { shift: usize, layout: SinusoidLayout },
    None,
}

impl PositionalEncoding {
    /// Whether this encoding can be combined with windowed attention.
    ///
    /// The bucket table is learned over unwindowed distances; windowed
    /// layers would silently truncate its logarithmic regime.
    #[must_use]
    pub const fn supports_local_window(&self) -> bool {
        !matches!(self, Self::RelativeBuckets { .. })
    }
}

// ---- Collectives and attention kinds ----

/// When the model-parallel reduction happens inside a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectivePoint {
    /// Reduce every sub-block output separately.
    Early,
    /// Reduce once per layer where the composition allows it.
    Late,
}

impl FromStr for CollectivePoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "early" => Ok(Self::Early),
            "late" => Ok(Self::Late),
            other => Err(Error::config(format!(
                "unsupported collective point '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    Global,
    Local,
}

impl FromStr for AttentionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Self::Global),
            "local" => Ok(Self::Local),
            other => Err(Error::config(format!("unsupported attention kind '{other}'"))),
        }
    }
}

// ---- Model config ----

/// Validated model configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub norm: NormConfig,
    pub positional: PositionalEncoding,
    pub activation: Activation,
    /// Gated-linear-unit feedforward.
    pub glu: bool,
    pub collective: CollectivePoint,
    /// One entry per layer.
    pub attention_layers: Vec<AttentionKind>,
    pub local_attention_window: usize,
    pub n_vocab: usize,
    pub n_vocab_padding: usize,
    pub d_model: usize,
    /// Token-embedding width when it differs from `d_model`; the embedding
    /// and head then project through `(d_embed, d_model)` linears.
    pub d_embed: Option<usize>,
    pub n_heads: usize,
    pub d_ff: usize,
    pub layers: usize,
    /// Longest sequence (and decode cache) a model is built for.
    pub seq: usize,
    pub topology: ShardTopology,
}

impl ModelConfig {
    /// A config with every optional setting at the variant's defaults:
    /// layernorm, full rotary, `d_ff = 4 * d_model`, window 256, one shard.
    #[must_use]
    pub fn new(
        architecture: Architecture,
        n_vocab: usize,
        d_model: usize,
        n_heads: usize,
        layers: usize,
        seq: usize,
    ) -> Self {
        let spec = architecture.spec();
        Self {
            architecture,
            norm: NormConfig::LAYERNORM,
            positional: PositionalEncoding::Rotary {
                fraction: 1.0,
                offset: spec.rotary_offset,
                layout: spec.rotary_layout,
            },
            activation: spec.activation,
            glu: false,
            collective: spec.collective,
            attention_layers: default_attention_layers(architecture, layers),
            local_attention_window: 256,
            n_vocab,
            n_vocab_padding: 0,
            d_model,
            d_embed: None,
            n_heads,
            d_ff: 4 * d_model,
            layers,
            seq,
            topology: ShardTopology::single(),
        }
    }

    /// Load and validate a configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a configuration from a JSON string
    ///
    /// # Errors
    /// Returns [`Error::Json`] for malformed JSON and
    /// [`Error::Configuration`] for unsupported names or combinations.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let config = Self::try_from(file)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub const fn spec(&self) -> ArchitectureSpec {
        self.architecture.spec()
    }

    #[must_use]
    pub const fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    #[must_use]
    pub const fn heads_per_shard(&self) -> usize {
        self.n_heads / self.topology.shard_count
    }

    /// Width of the token embedding and of the head's input.
    #[must_use]
    pub fn embed_width(&self) -> usize {
        self.d_embed.unwrap_or(self.d_model)
    }

    #[must_use]
    pub const fn padded_vocab(&self) -> usize {
        self.n_vocab + self.n_vocab_padding
    }

    /// Number of rotated dimensions per head (0 without rotary).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn rotary_dims(&self) -> usize {
        match self.positional {
            PositionalEncoding::Rotary { fraction, .. } => {
                (fraction * self.head_dim() as f32) as usize
            }
            _ => 0,
        }
    }

    /// Attention window for `layer`: `None` for global attention.
    #[must_use]
    pub fn attention_window(&self, layer: usize) -> Option<usize> {
        match self.attention_layers.get(layer) {
            Some(AttentionKind::Local) => Some(self.local_attention_window),
            _ => None,
        }
    }

    /// Check every structural constraint.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let shards = self.topology.shard_count;
        if shards == 0 || self.topology.replica_count == 0 {
            return Err(Error::config("shard_count and replica_count must be >= 1"));
        }
        if self.n_vocab == 0 || self.d_model == 0 || self.n_heads == 0 || self.layers == 0 {
            return Err(Error::config(
                "n_vocab, d_model, n_heads and layers must be non-zero",
            ));
        }
        if self.seq == 0 {
            return Err(Error::config("seq must be non-zero"));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(Error::config(format!(
                "n_heads {} does not divide d_model {}",
                self.n_heads, self.d_model
            )));
        }
        for (what, dim) in [
            ("padded vocabulary", self.padded_vocab()),
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("d_ff", self.d_ff),
            ("d_embed", self.embed_width()),
        ] {
            if dim % shards != 0 {
                return Err(Error::config(format!(
                    "shard_count {shards} does not divide {what} {dim}"
                )));
            }
        }
        if self.d_ff == 0 {
            return Err(Error::config("d_ff must be non-zero"));
        }
        if self.d_embed == Some(0) {
            return Err(Error::config("d_embed must be non-zero"));
        }
        if self.attention_layers.len() != self.layers {
            return Err(Error::config(format!(
                "attention_layers has {} entries for {} layers",
                self.attention_layers.len(),
                self.layers
            )));
        }

        let windowed = self.attention_layers.contains(&AttentionKind::Local);
        if windowed && self.local_attention_window == 0 {
            return Err(Error::config("local_attention_window must be non-zero"));
        }
        if windowed && !self.positional.supports_local_window() {
            return Err(Error::config(
                "windowed attention is not supported with relative-position buckets",
            ));
        }

        match self.positional {
            PositionalEncoding::Rotary { fraction, .. } => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(Error::config(format!(
                        "rotary fraction {fraction} must be in (0, 1]"
                    )));
                }
                let dims = self.rotary_dims();
                if dims == 0 || dims % 2 != 0 {
                    return Err(Error::config(format!(
                        "rotary fraction {fraction} of d_head {} gives {dims} dims; \
                         need an even, non-zero count",
                        self.head_dim()
                    )));
                }
            }
            PositionalEncoding::Alibi => {
                if !self.n_heads.is_power_of_two() {
                    return Err(Error::config(format!(
                        "ALiBi needs a power-of-two head count, got {}",
                        self.n_heads
                    )));
                }
            }
            PositionalEncoding::RelativeBuckets {
                num_buckets,
                max_distance,
            } => {
                if num_buckets < 2 || max_distance <= num_buckets / 2 {
                    return Err(Error::config(format!(
                        "relative buckets need num_buckets >= 2 and max_distance > \
                         num_buckets / 2 (got {num_buckets}, {max_distance})"
                    )));
                }
            }
            PositionalEncoding::Sinusoidal { .. } => {
                if self.d_model % 2 != 0 {
                    return Err(Error::config(format!(
                        "sinusoidal positions need an even d_model, got {}",
                        self.d_model
                    )));
                }
            }
            PositionalEncoding::Learned { .. } | PositionalEncoding::None => {}
        }

        if self.norm.kind == NormKind::DoubleLayerNorm && shards % 2 != 0 {
            return Err(Error::config(format!(
                "double layernorm needs an even shard_count, got {shards}"
            )));
        }
        Ok(())
    }
}

fn default_attention_layers(architecture: Architecture, layers: usize) -> Vec<AttentionKind> {
    (0..layers)
        .map(|i| {
            if architecture.spec().alternating_local && i % 2 == 1 {
                AttentionKind::Local
            } else {
                AttentionKind::Global
            }
        })
        .collect()
}

// ---- JSON file format ----

/// On-disk configuration: flat keys, names as strings.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    architecture: String,
    #[serde(default = "default_norm")]
    norm: String,
    #[serde(default = "default_pe")]
    pe: String,
    #[serde(default = "default_rotary_fraction")]
    pe_rotary_fraction: f32,
    #[serde(default)]
    pe_rotary_offset: Option<usize>,
    #[serde(default)]
    rotary_layout: Option<String>,
    #[serde(default)]
    pe_shift: Option<usize>,
    #[serde(default = "default_relative_buckets")]
    relative_buckets: usize,
    #[serde(default = "default_relative_max_distance")]
    relative_max_distance: usize,
    #[serde(default)]
    activation: Option<String>,
    #[serde(default)]
    glu: bool,
    #[serde(default)]
    collective: Option<String>,
    #[serde(default)]
    attention_layers: Option<Vec<String>>,
    #[serde(default = "default_local_window")]
    local_attention_window: usize,
    n_vocab: usize,
    #[serde(default)]
    n_vocab_padding: usize,
    d_model: usize,
    #[serde(default)]
    d_embed: Option<usize>,
    n_heads: usize,
    #[serde(default)]
    d_ff: Option<usize>,
    layers: usize,
    seq: usize,
    #[serde(default = "default_count", alias = "cores_per_replica")]
    shard_count: usize,
    #[serde(default = "default_count")]
    replica_count: usize,
}

fn default_norm() -> String {
    "layernorm".to_string()
}

fn default_pe() -> String {
    "rotary".to_string()
}

fn default_rotary_fraction() -> f32 {
    1.0
}

fn default_relative_buckets() -> usize {
    32
}

fn default_relative_max_distance() -> usize {
    128
}

fn default_local_window() -> usize {
    256
}

fn default_count() -> usize {
    1
}

impl TryFrom<ConfigFile> for ModelConfig {
    type Error = Error;

    fn try_from(file: ConfigFile) -> Result<Self> {
        let architecture: Architecture = file.architecture.parse()?;
        let spec = architecture.spec();

        let shift = file.pe_shift.unwrap_or(spec.rotary_offset);
        let positional = match file.pe.as_str() {
            "rotary" => PositionalEncoding::Rotary {
                fraction: file.pe_rotary_fraction,
                offset: file.pe_rotary_offset.unwrap_or(spec.rotary_offset),
                layout: match &file.rotary_layout {
                    Some(name) => name.parse()?,
                    None => spec.rotary_layout,
                },
            },
            "alibi" => PositionalEncoding::Alibi,
            "t5" | "relative" => PositionalEncoding::RelativeBuckets {
                num_buckets: file.relative_buckets,
                max_distance: file.relative_max_distance,
            },
            "fixed" | "learned" => PositionalEncoding::Learned { shift },
            "sinusoidal" => PositionalEncoding::Sinusoidal {
                shift,
                layout: SinusoidLayout::Interleaved,
            },
            "fairseq_sinusoidal" => PositionalEncoding::Sinusoidal {
                shift,
                layout: SinusoidLayout::Concatenated,
            },
            "none" => PositionalEncoding::None,
            other => {
                return Err(Error::config(format!(
                    "unsupported positional-encoding kind '{other}'"
                )))
            }
        };

        let activation = match &file.activation {
            Some(name) => name.parse()?,
            None => spec.activation,
        };
        let collective = match &file.collective {
            Some(name) => name.parse()?,
            None => spec.collective,
        };
        let attention_layers = match &file.attention_layers {
            Some(names) => names
                .iter()
                .map(|n| n.parse())
                .collect::<Result<Vec<AttentionKind>>>()?,
            None => default_attention_layers(architecture, file.layers),
        };

        Ok(Self {
            architecture,
            norm: file.norm.parse()?,
            positional,
            activation,
            glu: file.glu,
            collective,
            attention_layers,
            local_attention_window: file.local_attention_window,
            n_vocab: file.n_vocab,
            n_vocab_padding: file.n_vocab_padding,
            d_model: file.d_model,
            d_embed: file.d_embed.filter(|&e| e != file.d_model),
            n_heads: file.n_heads,
            d_ff: file.d_ff.unwrap_or(4 * file.d_model),
            layers: file.layers,
            seq: file.seq,
            topology: ShardTopology::new(file.shard_count, file.replica_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gptj_json(extra: &str) -> String {
        format!(
            r#"{{
                "architecture": "gpt-j",
                "n_vocab": 50,
                "n_vocab_padding": 2,
                "d_model": 16,
                "n_heads": 4,
                "layers": 2,
                "seq": 32
                {extra}
            }}"#
        )
    }

    #[test]
    fn test_parse_defaults() {
        let config = ModelConfig::from_json_str(&gptj_json("")).unwrap();
        assert_eq!(config.architecture, Architecture::GptJ);
        assert_eq!(config.norm, NormConfig::LAYERNORM);
        assert_eq!(config.activation, Activation::GeluTanh);
        assert_eq!(config.d_ff, 64);
        assert_eq!(config.padded_vocab(), 52);
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.rotary_dims(), 4);
        assert_eq!(config.topology, ShardTopology::single());
        assert_eq!(
            config.attention_layers,
            vec![AttentionKind::Global, AttentionKind::Global]
        );
    }

    #[test]
    fn test_parse_overrides() {
        let config = ModelConfig::from_json_str(&gptj_json(
            r#", "pe": "alibi", "activation": "swish", "collective": "early",
                "norm": "rmsnorm-bias", "cores_per_replica": 2, "glu": true"#,
        ))
        .unwrap();
        assert_eq!(config.positional, PositionalEncoding::Alibi);
        assert_eq!(config.activation, Activation::Silu);
        assert_eq!(config.collective, CollectivePoint::Early);
        assert_eq!(
            config.norm,
            NormConfig {
                kind: NormKind::RmsNorm,
                offset: true
            }
        );
        assert_eq!(config.topology.shard_count, 2);
        assert_eq!(config.heads_per_shard(), 2);
        assert!(config.glu);
    }

    #[test]
    fn test_neo_alternates_local_layers() {
        let config = ModelConfig::new(Architecture::GptNeo, 32, 16, 2, 4, 16);
        assert_eq!(config.attention_window(0), None);
        assert_eq!(config.attention_window(1), Some(256));
        assert_eq!(config.attention_window(3), Some(256));
    }

    #[test]
    fn test_fairseq_rotary_offset_default() {
        let config = ModelConfig::new(Architecture::FairseqLm, 32, 16, 2, 1, 16);
        assert!(matches!(
            config.positional,
            PositionalEncoding::Rotary { offset: 2, .. }
        ));
    }

    #[test]
    fn test_absolute_position_kinds() {
        let config = ModelConfig::from_json_str(&gptj_json(r#", "pe": "fixed""#)).unwrap();
        assert_eq!(config.positional, PositionalEncoding::Learned { shift: 0 });

        let config =
            ModelConfig::from_json_str(&gptj_json(r#", "pe": "sinusoidal", "pe_shift": 3"#))
                .unwrap();
        assert_eq!(
            config.positional,
            PositionalEncoding::Sinusoidal {
                shift: 3,
                layout: SinusoidLayout::Interleaved
            }
        );

        let json = gptj_json(r#", "pe": "fairseq_sinusoidal""#).replace("gpt-j", "fairseq-lm");
        let config = ModelConfig::from_json_str(&json).unwrap();
        assert_eq!(
            config.positional,
            PositionalEncoding::Sinusoidal {
                shift: 2,
                layout: SinusoidLayout::Concatenated
            }
        );
    }

    #[test]
    fn test_embedding_width() {
        let config = ModelConfig::from_json_str(&gptj_json(r#", "d_embed": 8"#)).unwrap();
        assert_eq!(config.d_embed, Some(8));
        assert_eq!(config.embed_width(), 8);

        // a d_embed equal to d_model needs no projections
        let config = ModelConfig::from_json_str(&gptj_json(r#", "d_embed": 16"#)).unwrap();
        assert_eq!(config.d_embed, None);

        let err = ModelConfig::from_json_str(&gptj_json(
            r#", "d_embed": 6, "shard_count": 4"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("d_embed"), "{err}");
    }

    #[test]
    fn test_unknown_names_are_configuration_errors() {
        for extra in [
            r#", "pe": "xpos""#,
            r#", "activation": "gelu_tanh_fast""#,
            r#", "norm": "batchnorm""#,
            r#", "collective": "eventually""#,
        ] {
            let err = ModelConfig::from_json_str(&gptj_json(extra)).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{extra}: {err}");
        }
        let err = ModelConfig::from_json_str(&gptj_json("").replace("gpt-j", "mamba"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_shard_divisibility() {
        let mut config = ModelConfig::new(Architecture::GptJ, 30, 16, 4, 1, 16);
        config.topology = ShardTopology::new(4, 1);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("padded vocabulary"), "{err}");

        config.n_vocab_padding = 2;
        config.validate().unwrap();

        config.n_heads = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_incompatible_combinations() {
        let mut config = ModelConfig::new(Architecture::GptNeo, 32, 16, 2, 2, 16);
        config.positional = PositionalEncoding::RelativeBuckets {
            num_buckets: 32,
            max_distance: 128,
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = ModelConfig::new(Architecture::Bloom, 32, 24, 6, 1, 16);
        config.positional = PositionalEncoding::Alibi;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::new(Architecture::GptJ, 32, 16, 2, 1, 16);
        config.norm = "doublelayernorm".parse().unwrap();
        assert!(config.validate().is_err());
        config.topology = ShardTopology::new(2, 1);
        config.validate().unwrap();

        let mut config = ModelConfig::new(Architecture::GptJ, 32, 16, 2, 1, 16);
        config.positional = PositionalEncoding::Rotary {
            fraction: 0.25,
            offset: 0,
            layout: RotaryLayout::Interleaved,
        };
        // 0.25 * 8 = 2 dims is fine, 0.1 * 8 = 0 is not
        config.validate().unwrap();
        config.positional = PositionalEncoding::Rotary {
            fraction: 0.1,
            offset: 0,
            layout: RotaryLayout::Interleaved,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_variant_table() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
        assert_eq!(
            Architecture::GptJ.spec().residual,
            Residual::Parallel { shared_norm: true }
        );
        assert_eq!(
            Architecture::NeoXSequential.spec().collective,
            CollectivePoint::Early
        );
        assert_eq!(
            Architecture::GptNeo.spec().logit_scaling,
            LogitScaling::Unscaled
        );
        assert!(!Architecture::OptPostNorm.spec().final_norm);
    }
}
