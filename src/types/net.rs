//! adapters for `inet` and `cidr`.

use std::{net::IpAddr, sync::Arc};

use postgres_types::{Oid, Type};

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    types::{Inet, Value, ValueKind},
};

fn render(net: &Inet) -> Vec<u8> {
    match net.prefix {
        Some(prefix) => format!("{}/{prefix}", net.addr).into_bytes(),
        None => net.addr.to_string().into_bytes(),
    }
}

fn parse(data: &[u8]) -> Result<Inet, Error> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::data("network address is not valid text"))?;
    let (addr_text, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => {
            let prefix = prefix
                .parse::<u8>()
                .map_err(|_| Error::data(format!("bad network prefix in {text:?}")))?;
            (addr, Some(prefix))
        }
        None => (text, None),
    };
    let addr: IpAddr = addr_text
        .parse()
        .map_err(|e| Error::data(format!("bad network address {text:?}: {e}")))?;
    Ok(Inet { addr, prefix })
}

struct InetDumper;

impl Dumper for InetDumper {
    fn oid(&self) -> Oid {
        Type::INET.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Inet(net) => Ok(Some(render(net))),
            other => Err(Error::programming(format!(
                "inet dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

struct CidrDumper;

impl Dumper for CidrDumper {
    fn oid(&self) -> Oid {
        Type::CIDR.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Cidr(net) => Ok(Some(render(net))),
            other => Err(Error::programming(format!(
                "cidr dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

struct InetLoader;

impl Loader for InetLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse(data).map(Value::Inet)
    }
}

struct CidrLoader;

impl Loader for CidrLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse(data).map(Value::Cidr)
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Inet, Arc::new(InetDumper), true);
    map.register_dumper(ValueKind::Cidr, Arc::new(CidrDumper), true);
    map.register_loader(Type::INET.oid(), Arc::new(InetLoader));
    map.register_loader(Type::CIDR.oid(), Arc::new(CidrLoader));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inet_with_and_without_prefix() {
        let net = parse(b"192.168.0.1/24").unwrap();
        assert_eq!(net.prefix, Some(24));
        assert_eq!(render(&net), b"192.168.0.1/24".to_vec());

        let bare = parse(b"::1").unwrap();
        assert_eq!(bare.prefix, None);
        assert!(bare.addr.is_loopback());
    }
}
