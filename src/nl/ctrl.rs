//! Generic netlink family resolution over the `nlctrl` family.
//!
//! One blocking `CTRL_CMD_GETFAMILY` round trip at startup turns the
//! family name into the numeric id and the named multicast groups the
//! daemon must join.

use log::debug;

use crate::{
    err::{DeError, SockError},
    nl::{
        attr::AttrIter,
        attr,
        msg::{GenlMsg, MsgBuilder, NlMsg},
        sock::{NlSock, RECV_BUF_LEN},
    },
};

const CTRL_VERSION: u8 = 2;

/// A resolved generic netlink family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    /// Numeric family id to address messages to.
    pub id: u16,
    /// `(name, id)` pairs of the family's multicast groups.
    pub mcast_groups: Vec<(String, u32)>,
}

impl Family {
    /// Look up a multicast group id by name.
    pub fn mcast_group(&self, name: &str) -> Option<u32> {
        self.mcast_groups
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

/// Resolve `name` to its family id and multicast groups.
pub fn resolve_family(sock: &NlSock, name: &str) -> Result<Family, SockError> {
    let seq = sock.next_seq();
    let mut builder = MsgBuilder::genl(
        libc::GENL_ID_CTRL as u16,
        libc::NLM_F_REQUEST as u16,
        libc::CTRL_CMD_GETFAMILY as u8,
        CTRL_VERSION,
    )
    .seq(seq);
    attr::put_str(builder.attrs(), libc::CTRL_ATTR_FAMILY_NAME as u16, name);
    sock.send(&builder.finish())?;

    let mut buf = vec![0u8; RECV_BUF_LEN];
    let len = sock.recv(&mut buf)?;
    for msg in NlMsg::parse_all(&buf[..len]) {
        let msg = msg?;
        if let Some(code) = msg.error_code() {
            if code == -libc::ENOENT {
                return Err(SockError::FamilyNotFound(name.to_string()));
            }
            if code != 0 {
                return Err(SockError::Nlmsgerr(code));
            }
            continue;
        }
        let genl = GenlMsg::parse(msg.payload)?;
        let attrs = AttrIter::new(genl.attrs);
        let id = attrs
            .require(libc::CTRL_ATTR_FAMILY_ID as u16, "CTRL_ATTR_FAMILY_ID")?
            .get_u16()?;
        let mcast_groups = parse_mcast_groups(&attrs)?;
        debug!("resolved genl family {name} to id {id}");
        return Ok(Family { id, mcast_groups });
    }
    Err(SockError::FamilyNotFound(name.to_string()))
}

fn parse_mcast_groups(attrs: &AttrIter) -> Result<Vec<(String, u32)>, DeError> {
    let mut groups = Vec::new();
    let block = match attrs.find(libc::CTRL_ATTR_MCAST_GROUPS as u16)? {
        Some(block) => block,
        None => return Ok(groups),
    };
    for entry in block.nested() {
        let entry = entry?.nested();
        let name = entry
            .require(
                libc::CTRL_ATTR_MCAST_GRP_NAME as u16,
                "CTRL_ATTR_MCAST_GRP_NAME",
            )?
            .get_str()?
            .to_string();
        let id = entry
            .require(
                libc::CTRL_ATTR_MCAST_GRP_ID as u16,
                "CTRL_ATTR_MCAST_GRP_ID",
            )?
            .get_u32()?;
        groups.push((name, id));
    }
    Ok(groups)
}

#[cfg(test)]
mod test {
    use super::*;

    // Build the same reply shape the kernel sends and make sure the
    // group walk holds up.
    #[test]
    fn test_parse_mcast_groups() {
        let mut buf = Vec::new();
        attr::put_u16(&mut buf, libc::CTRL_ATTR_FAMILY_ID as u16, 0x1d);
        let block = attr::begin_nested(&mut buf, libc::CTRL_ATTR_MCAST_GROUPS as u16);
        let first = attr::begin_nested(&mut buf, 1);
        attr::put_str(&mut buf, libc::CTRL_ATTR_MCAST_GRP_NAME as u16, "config");
        attr::put_u32(&mut buf, libc::CTRL_ATTR_MCAST_GRP_ID as u16, 5);
        attr::end_nested(&mut buf, first);
        attr::end_nested(&mut buf, block);

        let attrs = AttrIter::new(&buf);
        let groups = parse_mcast_groups(&attrs).unwrap();
        assert_eq!(groups, vec![("config".to_string(), 5)]);

        let family = Family {
            id: attrs
                .require(libc::CTRL_ATTR_FAMILY_ID as u16, "id")
                .unwrap()
                .get_u16()
                .unwrap(),
            mcast_groups: groups,
        };
        assert_eq!(family.id, 0x1d);
        assert_eq!(family.mcast_group("config"), Some(5));
        assert_eq!(family.mcast_group("other"), None);
    }
}
