use super::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use models::{EdgeRanking, EdgeType, PartitionId, TagId, Version, VertexId};

/// Length of the packed (partition, key-type) word which prefixes every key.
pub const PACKED_PREFIX_LEN: usize = 4;

/// The key-type tag held in the low byte of the packed prefix word.
/// The high 24 bits of the word hold the partition id, so all keys of a
/// partition are contiguous, and within a partition all keys of one type
/// are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    Vertex = 0x01,
    Edge = 0x02,
    Index = 0x03,
    /// Reserved for system metadata: leader hints, raft hard state,
    /// index-build progress, balance plans. Data keys never use this tag.
    System = b'_',
}

impl KeyType {
    fn from_byte(b: u8) -> Option<KeyType> {
        match b {
            0x01 => Some(KeyType::Vertex),
            0x02 => Some(KeyType::Edge),
            0x03 => Some(KeyType::Index),
            b'_' => Some(KeyType::System),
            _ => None,
        }
    }
}

/// A decoded vertex key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexKey {
    pub part: PartitionId,
    pub vid: VertexId,
    pub tag: TagId,
    pub version: Version,
}

/// A decoded edge key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeKey {
    pub part: PartitionId,
    pub src: VertexId,
    pub edge_type: EdgeType,
    pub ranking: EdgeRanking,
    pub dst: VertexId,
    pub version: Version,
}

fn packed(part: PartitionId, key_type: KeyType) -> [u8; 4] {
    let mut out = [0u8; 4];
    BigEndian::write_u32(&mut out, ((part as u32) << 8) | key_type as u32);
    out
}

/// Signed 32-bit values in keys are sign-flipped big-endian so that byte
/// order equals numeric order (negative edge types sort before positive).
fn write_i32_ord(buf: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, (v as u32) ^ 0x8000_0000);
    buf.extend_from_slice(&b);
}

fn read_i32_ord(b: &[u8]) -> i32 {
    (BigEndian::read_u32(b) ^ 0x8000_0000) as i32
}

pub(crate) fn write_i64_ord(buf: &mut Vec<u8>, v: i64) {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, (v as u64) ^ 0x8000_0000_0000_0000);
    buf.extend_from_slice(&b);
}

pub(crate) fn read_i64_ord(b: &[u8]) -> i64 {
    (BigEndian::read_u64(b) ^ 0x8000_0000_0000_0000) as i64
}

/// Versions are stored bitwise-inverted so a forward iteration over a
/// key prefix yields the newest version first.
fn write_version(buf: &mut Vec<u8>, v: Version) {
    let mut b = [0u8; 8];
    BigEndian::write_u64(&mut b, !v);
    buf.extend_from_slice(&b);
}

fn read_version(b: &[u8]) -> Version {
    !BigEndian::read_u64(b)
}

/// The partition id packed into any key's prefix word.
pub fn partition_id_of_key(key: &[u8]) -> Result<PartitionId> {
    if key.len() < PACKED_PREFIX_LEN {
        return Err(Error::InvalidKey {
            expected: "packed-prefix",
            len: key.len(),
        });
    }
    Ok((BigEndian::read_u32(key) >> 8) as PartitionId)
}

/// The key-type tag of any encoded key.
pub fn key_type(key: &[u8]) -> Result<KeyType> {
    if key.len() < PACKED_PREFIX_LEN {
        return Err(Error::InvalidKey {
            expected: "packed-prefix",
            len: key.len(),
        });
    }
    KeyType::from_byte(key[3]).ok_or(Error::InvalidKey {
        expected: "known key-type tag",
        len: key.len(),
    })
}

/// Half-open byte range covering every key of a partition, all types.
pub fn partition_range(part: PartitionId) -> (Vec<u8>, Vec<u8>) {
    let mut begin = [0u8; 4];
    let mut end = [0u8; 4];
    BigEndian::write_u32(&mut begin, (part as u32) << 8);
    BigEndian::write_u32(&mut end, ((part as u32) + 1) << 8);
    (begin.to_vec(), end.to_vec())
}

/// `packed(4) || vertexId(vid_len) || tagId(4) || ~version(8)`
pub fn vertex_key(
    part: PartitionId,
    vid: &VertexId,
    vid_len: usize,
    tag: TagId,
    version: Version,
) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(PACKED_PREFIX_LEN + vid_len + 4 + 8);
    key.extend_from_slice(&packed(part, KeyType::Vertex));
    key.extend_from_slice(&vid.padded(vid_len)?);
    write_i32_ord(&mut key, tag);
    write_version(&mut key, version);
    Ok(key)
}

/// Prefix of every vertex key in a partition.
pub fn vertex_prefix(part: PartitionId) -> Vec<u8> {
    packed(part, KeyType::Vertex).to_vec()
}

/// Prefix of every tag record of one vertex.
pub fn vertex_prefix_vid(part: PartitionId, vid: &VertexId, vid_len: usize) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(PACKED_PREFIX_LEN + vid_len);
    key.extend_from_slice(&packed(part, KeyType::Vertex));
    key.extend_from_slice(&vid.padded(vid_len)?);
    Ok(key)
}

/// Prefix of every version of one (vertex, tag) record.
pub fn vertex_prefix_tag(
    part: PartitionId,
    vid: &VertexId,
    vid_len: usize,
    tag: TagId,
) -> Result<Vec<u8>> {
    let mut key = vertex_prefix_vid(part, vid, vid_len)?;
    write_i32_ord(&mut key, tag);
    Ok(key)
}

pub fn parse_vertex(key: &[u8], vid_len: usize) -> Result<VertexKey> {
    let want = PACKED_PREFIX_LEN + vid_len + 4 + 8;
    if key.len() != want || key_type(key)? != KeyType::Vertex {
        return Err(Error::InvalidKey {
            expected: "vertex",
            len: key.len(),
        });
    }
    let vid = &key[PACKED_PREFIX_LEN..PACKED_PREFIX_LEN + vid_len];
    let tag_at = PACKED_PREFIX_LEN + vid_len;
    Ok(VertexKey {
        part: partition_id_of_key(key)?,
        vid: VertexId::from(vid),
        tag: read_i32_ord(&key[tag_at..]),
        version: read_version(&key[tag_at + 4..]),
    })
}

/// `packed(4) || srcId(vid_len) || edgeType(4) || ranking(8) || dstId(vid_len) || ~version(8)`
pub fn edge_key(
    part: PartitionId,
    src: &VertexId,
    vid_len: usize,
    edge_type: EdgeType,
    ranking: EdgeRanking,
    dst: &VertexId,
    version: Version,
) -> Result<Vec<u8>> {
    let mut key = edge_prefix_no_version(part, src, vid_len, edge_type, ranking, dst)?;
    write_version(&mut key, version);
    Ok(key)
}

/// Prefix of every edge key in a partition.
pub fn edge_prefix(part: PartitionId) -> Vec<u8> {
    packed(part, KeyType::Edge).to_vec()
}

/// Prefix of every edge record whose source is `src`.
pub fn edge_prefix_src(part: PartitionId, src: &VertexId, vid_len: usize) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(PACKED_PREFIX_LEN + vid_len);
    key.extend_from_slice(&packed(part, KeyType::Edge));
    key.extend_from_slice(&src.padded(vid_len)?);
    Ok(key)
}

/// Prefix of every edge record of one (src, edgeType).
pub fn edge_prefix_src_type(
    part: PartitionId,
    src: &VertexId,
    vid_len: usize,
    edge_type: EdgeType,
) -> Result<Vec<u8>> {
    let mut key = edge_prefix_src(part, src, vid_len)?;
    write_i32_ord(&mut key, edge_type);
    Ok(key)
}

/// Prefix of every version of one logical edge.
pub fn edge_prefix_no_version(
    part: PartitionId,
    src: &VertexId,
    vid_len: usize,
    edge_type: EdgeType,
    ranking: EdgeRanking,
    dst: &VertexId,
) -> Result<Vec<u8>> {
    let mut key = edge_prefix_src_type(part, src, vid_len, edge_type)?;
    write_i64_ord(&mut key, ranking);
    key.extend_from_slice(&dst.padded(vid_len)?);
    Ok(key)
}

pub fn parse_edge(key: &[u8], vid_len: usize) -> Result<EdgeKey> {
    let want = PACKED_PREFIX_LEN + vid_len + 4 + 8 + vid_len + 8;
    if key.len() != want || key_type(key)? != KeyType::Edge {
        return Err(Error::InvalidKey {
            expected: "edge",
            len: key.len(),
        });
    }
    let src_at = PACKED_PREFIX_LEN;
    let type_at = src_at + vid_len;
    let rank_at = type_at + 4;
    let dst_at = rank_at + 8;
    let ver_at = dst_at + vid_len;
    Ok(EdgeKey {
        part: partition_id_of_key(key)?,
        src: VertexId::from(&key[src_at..type_at]),
        edge_type: read_i32_ord(&key[type_at..]),
        ranking: read_i64_ord(&key[rank_at..]),
        dst: VertexId::from(&key[dst_at..ver_at]),
        version: read_version(&key[ver_at..]),
    })
}

/// `packed(4, type='_') || payload`
pub fn sys_key(part: PartitionId, payload: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(PACKED_PREFIX_LEN + payload.len());
    key.extend_from_slice(&packed(part, KeyType::System));
    key.extend_from_slice(payload);
    key
}

/// Prefix of every system key in a partition.
pub fn sys_prefix(part: PartitionId) -> Vec<u8> {
    packed(part, KeyType::System).to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::Itertools;

    const VID_LEN: usize = 8;

    fn vid(s: &str) -> VertexId {
        VertexId::from(s)
    }

    #[test]
    fn test_vertex_key_round_trip() {
        let key = vertex_key(7, &vid("v1"), VID_LEN, 42, 99).unwrap();
        let parsed = parse_vertex(&key, VID_LEN).unwrap();

        assert_eq!(parsed.part, 7);
        assert_eq!(parsed.vid, vid("v1\0\0\0\0\0\0"));
        assert_eq!(parsed.tag, 42);
        assert_eq!(parsed.version, 99);
    }

    #[test]
    fn test_vertex_key_layout_is_pinned() {
        let key = vertex_key(1, &vid("v1"), VID_LEN, 2, 3).unwrap();
        insta::assert_snapshot!(
            hex::encode(&key),
            @"00000101763100000000000080000002fffffffffffffffc"
        );
    }

    #[test]
    fn test_edge_key_round_trip() {
        let key = edge_key(3, &vid("src"), VID_LEN, -5, -7, &vid("dst"), 11).unwrap();
        let parsed = parse_edge(&key, VID_LEN).unwrap();

        assert_eq!(parsed.part, 3);
        assert_eq!(parsed.src, vid("src\0\0\0\0\0"));
        assert_eq!(parsed.edge_type, -5);
        assert_eq!(parsed.ranking, -7);
        assert_eq!(parsed.dst, vid("dst\0\0\0\0\0"));
        assert_eq!(parsed.version, 11);
    }

    #[test]
    fn test_vertex_key_order_matches_tuple_order() {
        // Lexicographic ordering of encoded keys must equal the tuple
        // ordering (partId, vid, tagId, ~version).
        let tuples = vec![
            (1, "a", 1, 9u64),
            (1, "a", 1, 2),
            (1, "a", 2, 9),
            (1, "b", 1, 1),
            (2, "a", 1, 1),
        ];
        let keys: Vec<_> = tuples
            .iter()
            .map(|(p, v, t, ver)| vertex_key(*p, &vid(v), VID_LEN, *t, *ver).unwrap())
            .collect();

        for (l, r) in keys.iter().tuple_windows() {
            assert!(l < r, "{} !< {}", hex::encode(l), hex::encode(r));
        }
    }

    #[test]
    fn test_newest_version_sorts_first() {
        let old = vertex_key(1, &vid("v"), VID_LEN, 1, 100).unwrap();
        let new = vertex_key(1, &vid("v"), VID_LEN, 1, 200).unwrap();
        assert!(new < old);
    }

    #[test]
    fn test_negative_edge_types_sort_before_positive() {
        let inbound = edge_key(1, &vid("v"), VID_LEN, -3, 0, &vid("w"), 1).unwrap();
        let outbound = edge_key(1, &vid("v"), VID_LEN, 3, 0, &vid("w"), 1).unwrap();
        assert!(inbound < outbound);

        // And ranking order is ascending signed order.
        let low = edge_key(1, &vid("v"), VID_LEN, 3, -10, &vid("w"), 1).unwrap();
        let high = edge_key(1, &vid("v"), VID_LEN, 3, 10, &vid("w"), 1).unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_partition_keys_are_contiguous() {
        let (begin, end) = partition_range(5);
        let vkey = vertex_key(5, &vid("v"), VID_LEN, 1, 1).unwrap();
        let ekey = edge_key(5, &vid("v"), VID_LEN, 1, 0, &vid("w"), 1).unwrap();
        let skey = sys_key(5, b"term");

        for key in [&vkey, &ekey, &skey] {
            assert!(begin.as_slice() <= key.as_slice() && key.as_slice() < end.as_slice());
        }
        let other = vertex_key(6, &vid("v"), VID_LEN, 1, 1).unwrap();
        assert!(other.as_slice() >= end.as_slice());
    }

    #[test]
    fn test_key_type_discrimination() {
        let vkey = vertex_key(1, &vid("v"), VID_LEN, 1, 1).unwrap();
        let ekey = edge_key(1, &vid("v"), VID_LEN, 1, 0, &vid("w"), 1).unwrap();
        let skey = sys_key(1, b"x");

        assert_eq!(key_type(&vkey).unwrap(), KeyType::Vertex);
        assert_eq!(key_type(&ekey).unwrap(), KeyType::Edge);
        assert_eq!(key_type(&skey).unwrap(), KeyType::System);
        assert!(key_type(b"\x00").is_err());
    }

    #[test]
    fn test_oversize_vid_is_rejected() {
        let err = vertex_key(1, &vid("way-too-long-vid"), VID_LEN, 1, 1).unwrap_err();
        assert!(matches!(err, Error::VidLength(_)));
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let ekey = edge_key(1, &vid("v"), VID_LEN, 1, 0, &vid("w"), 1).unwrap();
        assert!(matches!(
            parse_vertex(&ekey, VID_LEN),
            Err(Error::InvalidKey { expected: "vertex", .. })
        ));
    }
}
