use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ancho fijo de cada componente de una clave (160 bits).
pub const ID_BYTES: usize = 20;

/// Componente de 160 bits de una clave compuesta.
///
/// Igualdad y orden son byte a byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_BYTES]);

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Hash determinista de un nombre (SHA-256 truncado a 160 bits).
    pub fn hash(name: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(name.as_ref());
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest[..ID_BYTES]);
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random::<[u8; ID_BYTES]>())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_BYTES]
    }

    /// Primeros 8 caracteres hex, para logs.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

/// Clave compuesta: location / domain / content / version.
///
/// - `location` + `domain` identifican un slot lógico del DHT.
/// - `content` + `version` desambiguan valor y revisión.
///
/// Sirve tanto como dirección de almacenamiento como identificador
/// de enlace entre tareas (previous id / current id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key {
    location: Id,
    domain: Id,
    content: Id,
    version: Id,
}

impl Key {
    pub const ZERO: Key = Key {
        location: Id::ZERO,
        domain: Id::ZERO,
        content: Id::ZERO,
        version: Id::ZERO,
    };

    pub fn new(location: Id, domain: Id, content: Id, version: Id) -> Self {
        Self {
            location,
            domain,
            content,
            version,
        }
    }

    /// Dirección de almacenamiento: content y version en cero.
    pub fn storage(location: Id, domain: Id) -> Self {
        Self::new(location, domain, Id::ZERO, Id::ZERO)
    }

    /// Los cuatro componentes iguales a `Id::hash(name)`.
    /// Se usa para los ids bien conocidos de cada etapa.
    pub fn same(name: &str) -> Self {
        let id = Id::hash(name);
        Self::new(id, id, id, id)
    }

    pub fn location(&self) -> Id {
        self.location
    }

    pub fn domain(&self) -> Id {
        self.domain
    }

    pub fn content(&self) -> Id {
        self.content
    }

    pub fn version(&self) -> Id {
        self.version
    }
}

impl From<Id> for Key {
    fn from(location: Id) -> Self {
        Key::new(location, Id::ZERO, Id::ZERO, Id::ZERO)
    }
}

impl From<(Id, Id)> for Key {
    fn from((location, domain): (Id, Id)) -> Self {
        Key::storage(location, domain)
    }
}

impl From<(Id, Id, Id)> for Key {
    fn from((location, domain, content): (Id, Id, Id)) -> Self {
        Key::new(location, domain, content, Id::ZERO)
    }
}

impl From<(Id, Id, Id, Id)> for Key {
    fn from((location, domain, content, version): (Id, Id, Id, Id)) -> Self {
        Key::new(location, domain, content, version)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.location.short(),
            self.domain.short(),
            self.content.short(),
            self.version.short()
        )
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

/// Patrón sobre una clave: cada componente ausente acepta cualquier valor.
/// Sólo para comparar enlaces, nunca como dirección de almacenamiento.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyPattern {
    pub location: Option<Id>,
    pub domain: Option<Id>,
    pub content: Option<Id>,
    pub version: Option<Id>,
}

impl KeyPattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn exact(key: &Key) -> Self {
        Self {
            location: Some(key.location),
            domain: Some(key.domain),
            content: Some(key.content),
            version: Some(key.version),
        }
    }

    pub fn location(mut self, id: Id) -> Self {
        self.location = Some(id);
        self
    }

    pub fn domain(mut self, id: Id) -> Self {
        self.domain = Some(id);
        self
    }

    pub fn matches(&self, key: &Key) -> bool {
        fn ok(want: &Option<Id>, got: Id) -> bool {
            want.map(|w| w == got).unwrap_or(true)
        }

        ok(&self.location, key.location)
            && ok(&self.domain, key.domain)
            && ok(&self.content, key.content)
            && ok(&self.version, key.version)
    }
}

static LOCAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Id de texto prácticamente imposible de repetir:
/// `NAME[TS(<ms>)_RND(<u64>)_LC(<contador local>)]`.
pub fn time_random_id(name: &str) -> String {
    let ts = chrono::Utc::now().timestamp_millis();
    let rnd = rand::random::<u64>();
    let lc = LOCAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}[TS({})_RND({})_LC({})]", name.to_uppercase(), ts, rnd, lc)
}
