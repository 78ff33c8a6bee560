//! `DataChunkBlock`, the unit passed between packager/transmitter and
//! receiver/unpackager (§4.F.2-§4.F.4): one chunk's raw bytes plus the id
//! that ties it back to a metadata artifact's chunk list.

use mesh_ids::ChunkId;

#[derive(Clone, Debug)]
pub struct DataChunkBlock {
    pub chunk_id: ChunkId,
    pub data: Vec<u8>,
}
