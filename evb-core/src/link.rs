//! Link bootstrap: the small symmetric handshake that runs over a freshly
//! established reliable channel before any one-sided traffic.
//!
//! The poster (the side that will issue remote writes) and the pender (the
//! side that will receive them) exchange peer identifiers, the poster
//! announces the size of the region it posts from, and the pender answers
//! with the remote-memory descriptor the poster's writes will target.  The
//! handshake runs twice per peer pair, once for each direction of data flow.

use crate::error::{LinkError, TransportError};
use crate::transport::{LinkTransport, RemoteRegion, SharedRegion};
use evb_proto::constants::MAX_CONTRIBUTORS;
use evb_proto::{ImmData, SrcId};
use std::time::Duration;
use tracing::debug;

/// One logical peer connection, bootstrap completed.
#[derive(Debug)]
pub struct Link<T> {
    ep: T,
    id: SrcId,
    remote: Option<RemoteRegion>,
}

/// A pender-side link that has learned the poster's identity and region size
/// but has not yet told the poster where to write.  Call [`expose`] once the
/// local region is sized and registered.
///
/// [`expose`]: PendingLink::expose
#[derive(Debug)]
pub struct PendingLink<T> {
    ep: T,
    id: SrcId,
    announced: usize,
}

fn send_u32<T: LinkTransport>(ep: &mut T, val: u32, what: &str) -> Result<(), LinkError> {
    ep.send_sync(&val.to_ne_bytes())?;
    debug!(value = val, "sent peer {what}");
    Ok(())
}

fn recv_u32<T: LinkTransport>(ep: &mut T, what: &str) -> Result<u32, LinkError> {
    let mut buf = [0u8; 4];
    ep.recv_sync(&mut buf)?;
    let val = u32::from_ne_bytes(buf);
    debug!(value = val, "received peer's {what}");
    Ok(val)
}

fn check_id(id: u32) -> Result<SrcId, LinkError> {
    if id as usize >= MAX_CONTRIBUTORS {
        return Err(LinkError::BadPeerId(id));
    }
    Ok(SrcId(id as u8))
}

impl<T: LinkTransport> Link<T> {
    /// Runs the poster side of the handshake.  `region_size` is the extent of
    /// the local region later writes are sourced from; the peer uses it to
    /// carve its mirror.
    pub fn poster(mut ep: T, my_id: SrcId, region_size: usize) -> Result<Link<T>, LinkError> {
        send_u32(&mut ep, my_id.0 as u32, "ID")?;
        let id = check_id(recv_u32(&mut ep, "ID")?)?;
        send_u32(&mut ep, region_size as u32, "region size")?;

        let mut buf = [0u8; RemoteRegion::WIRE_SIZE];
        ep.recv_sync(&mut buf).map_err(LinkError::from)?;
        let remote = RemoteRegion::read_from(&buf);
        debug!(peer = %id, extent = remote.extent, "received remote memory region");

        Ok(Link {
            ep,
            id,
            remote: Some(remote),
        })
    }

    /// Runs the pender side of the handshake up to the point where the local
    /// region must be sized; the caller finishes with [`PendingLink::expose`].
    pub fn pender(mut ep: T, my_id: SrcId) -> Result<PendingLink<T>, LinkError> {
        let id = check_id(recv_u32(&mut ep, "ID")?)?;
        send_u32(&mut ep, my_id.0 as u32, "ID")?;
        let announced = recv_u32(&mut ep, "region size")? as usize;
        if announced == 0 {
            return Err(LinkError::SizeMismatch {
                announced,
                allocated: 0,
            });
        }
        Ok(PendingLink { ep, id, announced })
    }

    /// The peer's announced identifier.
    pub fn id(&self) -> SrcId {
        self.id
    }

    pub fn remote(&self) -> Option<&RemoteRegion> {
        self.remote.as_ref()
    }

    /// One-sided write at `offset` within the peer's region.
    pub fn post(
        &mut self,
        buf: &[u8],
        offset: usize,
        imm: ImmData,
    ) -> Result<(), TransportError> {
        let remote = self
            .remote
            .ok_or_else(|| TransportError::Failed("no remote region on this link".into()))?;
        self.ep.write_data(buf, &remote, offset, imm)
    }

    /// Immediate-only message, used to return a freed transition slot.
    pub fn inject(&mut self, imm: ImmData) -> Result<(), TransportError> {
        self.ep.inject(imm)
    }

    pub fn poll(&mut self) -> Option<ImmData> {
        self.ep.poll()
    }

    pub fn poll_wait(&mut self, tmo: Duration) -> Result<ImmData, TransportError> {
        self.ep.poll_wait(tmo)
    }
}

impl<T: LinkTransport> PendingLink<T> {
    pub fn id(&self) -> SrcId {
        self.id
    }

    /// The region size the poster announced.
    pub fn announced_size(&self) -> usize {
        self.announced
    }

    /// Registers the local region the poster will write into and sends its
    /// descriptor, completing the handshake.
    pub fn expose(mut self, region: &SharedRegion) -> Result<Link<T>, LinkError> {
        self.ep.register_region(region)?;
        let descriptor = region.descriptor();
        let mut buf = [0u8; RemoteRegion::WIRE_SIZE];
        descriptor.write_to(&mut buf);
        self.ep.send_sync(&buf).map_err(LinkError::from)?;
        debug!(peer = %self.id, extent = descriptor.extent, "sent local memory region");
        Ok(Link {
            ep: self.ep,
            id: self.id,
            remote: None,
        })
    }
}

/// Re-indexes freshly bootstrapped links by the peer identifier each one
/// announced, so tables like `links[src]` and `regions[src]` address by peer
/// id directly.
pub fn sort_links<T>(links: Vec<Link<T>>, count: usize) -> Result<Vec<Link<T>>, LinkError> {
    let mut slots: Vec<Option<Link<T>>> = Vec::with_capacity(count);
    slots.resize_with(count, || None);
    for link in links {
        let id = link.id.0 as usize;
        if id >= count || slots[id].is_some() {
            return Err(LinkError::BadPeerId(id as u32));
        }
        slots[id] = Some(link);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(id, slot)| slot.ok_or(LinkError::BadPeerId(id as u32)))
        .collect()
}
