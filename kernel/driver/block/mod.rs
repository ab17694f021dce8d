pub mod virtio_blk;
