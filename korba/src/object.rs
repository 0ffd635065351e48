use crate::cdr::CdrWriter;
use crate::error::Result;
use crate::giop::LocateStatus;
use crate::ior::Ior;
use crate::orb::Orb;

/// A remote object proxy: an IOR plus the ORB that can reach it. Typed
/// stubs wrap this and narrow through `is_a`.
#[derive(Clone)]
pub struct ObjectRef {
    orb: Orb,
    ior: Ior,
}

impl ObjectRef {
    pub(crate) fn new(orb: Orb, ior: Ior) -> ObjectRef {
        ObjectRef { orb, ior }
    }

    pub fn orb(&self) -> &Orb {
        &self.orb
    }

    pub fn ior(&self) -> &Ior {
        &self.ior
    }

    pub fn type_id(&self) -> &str {
        &self.ior.type_id
    }

    pub fn is_nil(&self) -> bool {
        self.ior.is_nil()
    }

    /// Remote type probe. A matching IOR type id answers locally; anything
    /// else asks the servant.
    pub async fn is_a(&self, repository_id: &str) -> Result<bool> {
        if !self.ior.type_id.is_empty() && self.ior.type_id == repository_id {
            return Ok(true);
        }
        let mut w = CdrWriter::with_giop_minor(
            self.orb.options().byte_order,
            self.orb.options().giop_minor,
        );
        w.write_string(repository_id);
        let reply = self
            .orb
            .invoke_with_encoded(self, "_is_a", w.into_bytes())
            .await?;
        reply.reader().read_bool()
    }

    pub async fn non_existent(&self) -> Result<bool> {
        if self.is_nil() {
            return Ok(true);
        }
        let reply = self
            .orb
            .invoke_with_encoded(self, "_non_existent", Vec::new())
            .await?;
        reply.reader().read_bool()
    }

    /// Hash of the canonical reference, folded into `[0, maximum]`.
    pub fn hash(&self, maximum: u32) -> u32 {
        let digest = cityhash_rs::cityhash_102_128(&self.ior.canonical().to_encapsulation_bytes());
        (digest % (u128::from(maximum) + 1)) as u32
    }

    /// Two references are equivalent when their canonical stringifications
    /// match byte for byte.
    pub fn is_equivalent(&self, other: &ObjectRef) -> bool {
        self.ior.is_equivalent(&other.ior)
    }

    /// Asks the remote ORB where the object lives.
    pub async fn locate(&self) -> Result<LocateStatus> {
        self.orb.locate(self).await
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type_id", &self.ior.type_id)
            .field("profiles", &self.ior.profiles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_bounded() {
        // hashing needs no ORB, exercise the pure parts through Ior directly
        let ior = Ior::new_iiop("IDL:Test/Echo:1.0", "127.0.0.1", 4097, vec![1, 2, 3]);
        let digest = cityhash_rs::cityhash_102_128(&ior.canonical().to_encapsulation_bytes());
        let a = (digest % 101u128) as u32;
        let b = (digest % 101u128) as u32;
        assert_eq!(a, b);
        assert!(a <= 100);
    }
}
