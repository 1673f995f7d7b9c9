use tracing::debug;

use crate::error::GlError;
use crate::gl::{BlendEquation, BlendFactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub equation: BlendEquation,
}

impl BlendComponent {
    /// `src * 1 + dst * 0`, the GL initial state.
    pub const REPLACE: Self = Self {
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        equation: BlendEquation::Add,
    };

    /// `GL_MIN` / `GL_MAX` ignore the factors.
    pub fn canonical(self) -> Self {
        match self.equation {
            BlendEquation::Min | BlendEquation::Max => Self {
                src: BlendFactor::One,
                dst: BlendFactor::One,
                equation: self.equation,
            },
            _ => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            color: BlendComponent::REPLACE,
            alpha: BlendComponent::REPLACE,
        }
    }
}

impl BlendState {
    pub fn uses_constant(&self) -> bool {
        self.enabled
            && [self.color.src, self.color.dst, self.alpha.src, self.alpha.dst]
                .into_iter()
                .any(|f| {
                    matches!(
                        f,
                        BlendFactor::ConstantColor
                            | BlendFactor::OneMinusConstantColor
                            | BlendFactor::ConstantAlpha
                            | BlendFactor::OneMinusConstantAlpha
                    )
                })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorMask {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
    pub alpha: bool,
}

impl Default for ColorMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl ColorMask {
    pub const ALL: Self = Self {
        red: true,
        green: true,
        blue: true,
        alpha: true,
    };

    pub const fn from_array(mask: [bool; 4]) -> Self {
        Self {
            red: mask[0],
            green: mask[1],
            blue: mask[2],
            alpha: mask[3],
        }
    }
}

pub(crate) fn parse_src_factor(value: u32) -> Result<BlendFactor, GlError> {
    BlendFactor::from_gl(value).ok_or_else(|| {
        debug!(value, "unknown blend factor");
        GlError::InvalidEnum
    })
}

pub(crate) fn parse_dst_factor(value: u32) -> Result<BlendFactor, GlError> {
    match parse_src_factor(value)? {
        BlendFactor::SrcAlphaSaturate => {
            debug!(value, "GL_SRC_ALPHA_SATURATE is only valid as a source factor");
            Err(GlError::InvalidEnum)
        }
        factor => Ok(factor),
    }
}

pub(crate) fn parse_equation(value: u32) -> Result<BlendEquation, GlError> {
    BlendEquation::from_gl(value).ok_or_else(|| {
        debug!(value, "unknown blend equation");
        GlError::InvalidEnum
    })
}
