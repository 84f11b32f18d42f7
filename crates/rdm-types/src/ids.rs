handle_type!(
    /// Connection-manager channel (one `rdma_cm_id`).
    ChannelId,
    u64,
    "ch"
);
handle_type!(
    /// Queue pair attached to a channel.
    QpHandle,
    u64,
    "qp"
);
handle_type!(
    /// Completion queue.
    CqHandle,
    u64,
    "cq"
);
handle_type!(
    /// Process-local endpoint identity.
    EndpointId,
    u64,
    "ep"
);
