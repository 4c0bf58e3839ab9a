/*!
 * RPC Definitions
 * Generated protobuf/gRPC code for the controller, fan-out and Supervisor
 * surfaces
 */

pub mod crane {
    tonic::include_proto!("crane");

    pub mod supervisor {
        tonic::include_proto!("crane.supervisor");
    }
}
