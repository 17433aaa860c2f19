//! Game descriptor
//!
//! The engine only reads [`GameKind`] from a descriptor, to default the transport mode of a
//! session. The rest of the descriptor travels with it for handlers.
use std::path::PathBuf;

/// Client platform of the game being intercepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GameKind {
  /// Flash/AIR client speaking raw TCP
  #[default]
  Flash,
  /// Unity (WebGL) client speaking secure WebSockets
  Unity,
}

impl GameKind {
  /// Whether sessions for this kind are negotiated over secure WebSockets.
  pub fn uses_web_sockets(self) -> bool {
    matches!(self, GameKind::Unity)
  }
}

/// Descriptor of an installed game client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Game {
  /// client platform
  pub kind: GameKind,
  /// client revision string
  pub revision: String,
  /// location of the client binary
  pub path: PathBuf,
  /// whether the client is an AIR build
  pub is_air: bool,
  /// whether the client uses post-shuffle message ids
  pub is_post_shuffle: bool,
}

impl Game {
  /// Create a descriptor for the given kind and revision.
  pub fn new(kind: GameKind, revision: impl Into<String>) -> Self {
    Self {
      kind,
      revision: revision.into(),
      ..Default::default()
    }
  }
}

#[cfg(feature = "serde")]
impl Game {
  /// Load the descriptor part of a cached game document.
  ///
  /// Message tables present in the document are ignored.
  pub fn from_json(json: &[u8]) -> crate::Result<Self> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CachedGame {
      path: PathBuf,
      is_unity: bool,
      #[serde(default)]
      is_air: bool,
      revision: String,
      #[serde(default)]
      is_post_shuffle: bool,
    }
    let cached: CachedGame = serde_json::from_slice(json)
      .map_err(|e| crate::Error::configuration(format!("invalid cached game: {}", e)))?;
    Ok(Self {
      kind: if cached.is_unity {
        GameKind::Unity
      } else {
        GameKind::Flash
      },
      revision: cached.revision,
      path: cached.path,
      is_air: cached.is_air,
      is_post_shuffle: cached.is_post_shuffle,
    })
  }
}
